//! Command/response correlation
//!
//! Pairs one outgoing command with the first frame that plausibly answers
//! it. Each call subscribes to the frame stream before writing and drops the
//! subscription on every exit path, so frames that arrive later never reach
//! a finished call.
//!
//! The command timeout bounds the whole exchange, the write included.
//!
//! Callers are expected to await one call before issuing the next; nothing
//! here serializes concurrent calls.

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::Command;
use crate::frame::{normalize, Frame};
use crate::mode;
use crate::outcome::Outcome;
use crate::session::Session;

const ATTENTION_PREFIX: &str = "AT";
const SUCCESS_TOKEN: &str = "OK";
const ERROR_TOKEN: &str = "?";

/// Which frames can answer a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    /// Data request: the reply starts with `41` and the requested PID
    Pid { prefix: String },
    /// Adapter command: the reply carries `OK`, the echo or `?`
    Attention { command: String },
    /// Anything else accepts the next frame
    Any,
}

impl ResponseMatcher {
    /// Classify a command by its wire text
    pub fn for_command(wire: &str) -> Self {
        let command = normalize(wire);
        let service = format!("{:02X}", mode::CURRENT_DATA);

        if command.starts_with(&service) {
            if let Some(pid) = command.get(2..4) {
                return Self::Pid {
                    prefix: format!("{:02X}{pid}", mode::positive_response(mode::CURRENT_DATA)),
                };
            }
        }
        if command.starts_with(ATTENTION_PREFIX) {
            return Self::Attention { command };
        }
        Self::Any
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        let text = frame.normalized();
        match self {
            Self::Pid { prefix } => text.starts_with(prefix.as_str()),
            Self::Attention { command } => {
                text.contains(SUCCESS_TOKEN)
                    || text.contains(command.as_str())
                    || text.contains(ERROR_TOKEN)
            }
            Self::Any => true,
        }
    }
}

/// Sends commands over a [`Session`] and waits for their replies
#[derive(Clone)]
pub struct Correlator {
    session: Session,
}

impl Correlator {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send `command` and resolve it with exactly one outcome
    pub async fn send<T>(&self, command: &Command<T>) -> Outcome<T> {
        if !self.session.state().is_connected() {
            debug!(command = command.wire(), "Not connected, command not sent");
            return Outcome::NotConnected;
        }

        let matcher = ResponseMatcher::for_command(command.wire());
        let deadline = Instant::now() + command.timeout();
        // Subscribe first so a fast reply cannot slip past
        let mut frames = self.session.subscribe_frames();

        if let Err(e) = self.session.send_line(command.wire(), command.timeout()).await {
            debug!(command = command.wire(), error = %e, "Send failed");
            if Instant::now() >= deadline {
                return Outcome::Timeout;
            }
            return Outcome::NotConnected;
        }

        let reply = async {
            loop {
                match frames.recv().await {
                    Ok(frame) if matcher.matches(&frame) => return Some(frame),
                    Ok(frame) => {
                        debug!(command = command.wire(), %frame, "Ignoring unrelated frame");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(command = command.wire(), missed, "Frame subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Some(raw)) => match command.parse(&raw) {
                Some(value) => Outcome::Success { value, raw },
                None => {
                    warn!(command = command.wire(), frame = %raw, "Unparseable reply");
                    Outcome::ParseError { raw }
                }
            },
            Ok(None) => Outcome::NotConnected,
            Err(_) => {
                debug!(
                    command = command.wire(),
                    timeout_ms = command.timeout().as_millis() as u64,
                    "No reply before deadline"
                );
                Outcome::Timeout
            }
        }
    }
}
