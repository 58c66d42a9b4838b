//! OBD-II Protocol Implementation
//!
//! This crate drives ELM327-compatible OBD-II adapters over any async duplex
//! byte stream (serial, Bluetooth SPP via RFCOMM, TCP). It covers the
//! connection lifecycle, prompt-delimited response framing, request/response
//! correlation with timeouts and the adapter setup sequence.
//!
//! ```text
//! link bytes -> ResponseFramer -> frame broadcast -> Correlator -> Outcome<T>
//! ```

pub mod command;
pub mod correlator;
mod error;
pub mod frame;
pub mod init;
mod outcome;
mod pid;
mod protocol;
pub mod session;
mod state;
pub mod transport;

pub use command::Command;
pub use correlator::{Correlator, ResponseMatcher};
pub use error::ObdError;
pub use frame::{Frame, ResponseFramer};
pub use init::{InitConfig, InitReport, InitSequencer};
pub use outcome::Outcome;
pub use pid::Pid;
pub use protocol::ObdProtocol;
pub use session::{Session, SessionConfig};
pub use state::ConnectionState;
pub use transport::{BoxedLink, Connector, SerialConnector, TcpConnector};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;

    /// Service byte of a positive reply to `mode`
    pub const fn positive_response(mode: u8) -> u8 {
        mode + 0x40
    }
}
