//! Command descriptors
//!
//! A command is plain data: the text put on the wire, how to turn the
//! matching reply into a value, and how long to wait for that reply.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{normalize, Frame};
use crate::pid::Pid;

/// Default wait for a data request reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default wait for an `AT` command reply (resets take a while)
pub const ATTENTION_TIMEOUT: Duration = Duration::from_millis(3000);

type Parser<T> = Arc<dyn Fn(&str) -> Option<T> + Send + Sync>;

/// An immutable request descriptor
pub struct Command<T> {
    wire: String,
    parser: Parser<T>,
    timeout: Duration,
}

impl<T> Command<T> {
    /// Build a command from its wire text and reply parser
    pub fn new<F>(wire: impl Into<String>, parser: F, timeout: Duration) -> Self
    where
        F: Fn(&str) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            wire: wire.into(),
            parser: Arc::new(parser),
            timeout,
        }
    }

    /// Same command with a different reply deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Request text without the trailing carriage return
    pub fn wire(&self) -> &str {
        &self.wire
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the reply parser over a frame
    pub fn parse(&self, frame: &Frame) -> Option<T> {
        (self.parser)(frame.as_str())
    }
}

impl Command<i32> {
    /// Mode 01 request for a PID, decoded with that PID's formula
    pub fn pid(pid: Pid) -> Self {
        Self::new(pid.request(), move |reply| pid.parse(reply), DEFAULT_TIMEOUT)
    }

    /// Engine RPM (`010C`)
    pub fn rpm() -> Self {
        Self::pid(Pid::Rpm)
    }

    /// Vehicle speed in km/h (`010D`)
    pub fn speed() -> Self {
        Self::pid(Pid::Speed)
    }

    /// Coolant temperature in °C (`0105`)
    pub fn coolant_temp() -> Self {
        Self::pid(Pid::CoolantTemp)
    }
}

impl Command<()> {
    /// Adapter configuration command such as `ATE0`.
    ///
    /// The reply is accepted when it contains `OK` or echoes the command.
    pub fn attention(wire: impl Into<String>) -> Self {
        let wire = wire.into();
        let expected = normalize(&wire);
        Self::new(
            wire,
            move |reply| {
                let reply = normalize(reply);
                (reply.contains("OK") || reply.contains(&expected)).then_some(())
            },
            ATTENTION_TIMEOUT,
        )
    }
}

impl<T> Clone for Command<T> {
    fn clone(&self) -> Self {
        Self {
            wire: self.wire.clone(),
            parser: Arc::clone(&self.parser),
            timeout: self.timeout,
        }
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("wire", &self.wire)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
