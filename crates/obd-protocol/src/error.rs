//! OBD-II Error Types

use thiserror::Error;

/// Transport-level and lifecycle errors.
///
/// Command-level failures (timeouts, unparseable replies) are not errors;
/// they come back as [`crate::Outcome`] values.
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Underlying I/O failure while opening or using the link
    #[error("I/O error: {0}")]
    Io(String),

    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Reading from the adapter failed
    #[error("Read error: {0}")]
    Read(String),

    /// Writing a command to the adapter failed
    #[error("Write error: {0}")]
    Write(String),

    /// The adapter closed the stream
    #[error("Device disconnected")]
    ConnectionClosed,

    /// No link is established
    #[error("Not connected")]
    NotConnected,

    /// The adapter setup sequence could not be completed
    #[error("Initialization aborted: {0}")]
    InitAborted(String),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Serial(err.to_string())
    }
}
