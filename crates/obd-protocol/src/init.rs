//! Adapter initialization
//!
//! Runs once per new connection: reset, echo off, linefeeds off, headers
//! off, spaces off, then select the protocol. Each command waits for its
//! outcome before the next is sent.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{Command, ATTENTION_TIMEOUT};
use crate::correlator::Correlator;
use crate::error::ObdError;
use crate::outcome::Outcome;
use crate::protocol::ObdProtocol;

/// Adapter setup commands sent before the protocol selection
pub const SETUP_COMMANDS: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATH0", "ATS0"];

#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Protocol selected by the last command
    pub protocol: ObdProtocol,
    /// Pause after each command
    pub pacing: Duration,
    pub command_timeout: Duration,
    /// Timeouts in a row that abort the sequence; 0 never aborts
    pub max_consecutive_timeouts: u32,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::Auto,
            pacing: Duration::from_millis(100),
            command_timeout: ATTENTION_TIMEOUT,
            max_consecutive_timeouts: 3,
        }
    }
}

/// How the adapter answered the init sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub succeeded: usize,
    /// Answered, but not with `OK` or the echo
    pub rejected: usize,
    pub timed_out: usize,
}

/// Sends the fixed setup sequence over a correlator
#[derive(Debug, Clone)]
pub struct InitSequencer {
    config: InitConfig,
    commands: Vec<Command<()>>,
}

impl InitSequencer {
    pub fn new(config: InitConfig) -> Self {
        let commands = SETUP_COMMANDS
            .iter()
            .map(|wire| wire.to_string())
            .chain(std::iter::once(config.protocol.set_protocol_command()))
            .map(|wire| Command::attention(wire).with_timeout(config.command_timeout))
            .collect();
        Self { config, commands }
    }

    pub fn commands(&self) -> &[Command<()>] {
        &self.commands
    }

    /// Run the sequence.
    ///
    /// Rejected or unanswered commands are logged and skipped. Losing the
    /// connection, or too many timeouts in a row, aborts the sequence and
    /// disconnects the session.
    pub async fn run(&self, correlator: &Correlator) -> Result<InitReport, ObdError> {
        info!(protocol = ?self.config.protocol, "Initializing adapter");
        let mut report = InitReport::default();
        let mut consecutive_timeouts = 0u32;

        for command in &self.commands {
            match correlator.send(command).await {
                Outcome::Success { raw, .. } => {
                    debug!(command = command.wire(), reply = %raw, "Init command accepted");
                    report.succeeded += 1;
                    consecutive_timeouts = 0;
                }
                Outcome::ParseError { raw } => {
                    warn!(command = command.wire(), reply = %raw, "Init command rejected");
                    report.rejected += 1;
                    consecutive_timeouts = 0;
                }
                Outcome::Timeout => {
                    warn!(command = command.wire(), "Init command timed out");
                    report.timed_out += 1;
                    consecutive_timeouts += 1;
                    let limit = self.config.max_consecutive_timeouts;
                    if limit > 0 && consecutive_timeouts >= limit {
                        let reason = format!("{consecutive_timeouts} consecutive timeouts");
                        return Err(self.abort(correlator, ObdError::InitAborted(reason)).await);
                    }
                }
                Outcome::NotConnected => {
                    return Err(self.abort(correlator, ObdError::NotConnected).await);
                }
            }

            tokio::time::sleep(self.config.pacing).await;
        }

        info!(
            succeeded = report.succeeded,
            rejected = report.rejected,
            timed_out = report.timed_out,
            "Adapter initialized"
        );
        Ok(report)
    }

    async fn abort(&self, correlator: &Correlator, error: ObdError) -> ObdError {
        warn!(error = %error, "Initialization aborted, disconnecting");
        correlator.session().disconnect().await;
        error
    }
}

impl Default for InitSequencer {
    fn default() -> Self {
        Self::new(InitConfig::default())
    }
}
