//! TCP connector for Wi-Fi adapters

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxedLink, Connector};
use crate::error::ObdError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens TCP connections; the target is `host:port`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &str) -> Result<BoxedLink, ObdError> {
        debug!(address = target, "Opening TCP connection");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                ObdError::Io(format!(
                    "connect to {target} timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
