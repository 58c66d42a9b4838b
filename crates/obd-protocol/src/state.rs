//! Connection state

use std::fmt;

/// Lifecycle of the link to the adapter. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting {
        target: String,
    },
    Connected {
        target: String,
    },
    /// Sticky until the next `connect()`
    Error {
        message: String,
        target: Option<String>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting { .. } | ConnectionState::Connected { .. }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting { target } | ConnectionState::Connected { target } => {
                Some(target)
            }
            ConnectionState::Error { target, .. } => target.as_deref(),
        }
    }

    /// Human-readable status line
    pub fn status_text(&self) -> String {
        match self {
            ConnectionState::Disconnected => "Status: Disconnected".to_string(),
            ConnectionState::Connecting { target } => format!("Status: Connecting to {target}..."),
            ConnectionState::Connected { target } => format!("Status: Connected to {target}"),
            ConnectionState::Error {
                message,
                target: Some(target),
            } => format!("Status: Error - {message} ({target})"),
            ConnectionState::Error {
                message,
                target: None,
            } => format!("Status: Error - {message}"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting { .. } => f.write_str("connecting"),
            ConnectionState::Connected { .. } => f.write_str("connected"),
            ConnectionState::Error { .. } => f.write_str("error"),
        }
    }
}
