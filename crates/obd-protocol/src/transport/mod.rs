//! Transport layer
//!
//! The engine talks to the adapter over any duplex byte stream. A
//! [`Connector`] opens one for a target string:
//! - [`SerialConnector`] for serial devices, including Bluetooth SPP bound to `/dev/rfcommN`
//! - [`TcpConnector`] for Wi-Fi adapters (`host:port`)
//! - [`mock::MockConnector`] for tests and bench runs

pub mod mock;
mod serial;
mod tcp;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ObdError;

pub use serial::{SerialConnector, DEFAULT_BAUD_RATE};
pub use tcp::TcpConnector;

/// A connected duplex byte stream to the adapter
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

pub type BoxedLink = Box<dyn Link>;

/// Opens links to adapters
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `target`.
    ///
    /// Reads of zero bytes on the returned link mean the adapter closed it.
    async fn connect(&self, target: &str) -> Result<BoxedLink, ObdError>;
}
