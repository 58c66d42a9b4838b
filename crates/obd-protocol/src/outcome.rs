//! Command outcomes

use crate::frame::Frame;

/// Result of one correlated command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// A matching reply arrived and parsed
    Success { value: T, raw: Frame },
    /// A matching reply arrived but the parser rejected it
    ParseError { raw: Frame },
    /// The session was not connected; nothing was sent
    NotConnected,
    /// No matching reply before the command's deadline
    Timeout,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The reply that resolved the call, if any
    pub fn raw(&self) -> Option<&Frame> {
        match self {
            Outcome::Success { raw, .. } | Outcome::ParseError { raw } => Some(raw),
            _ => None,
        }
    }
}
