//! Serial port connector

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::{BoxedLink, Connector};
use crate::error::ObdError;

/// Default ELM327 serial speed
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Opens serial devices; the target is the device path
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, target: &str) -> Result<BoxedLink, ObdError> {
        debug!(device = target, baud_rate = self.baud_rate, "Opening serial port");
        let port = tokio_serial::new(target, self.baud_rate).open_native_async()?;
        Ok(Box::new(port))
    }
}
