//! OBD-II Live Monitor - Main Entry Point

use anyhow::Context;
use obd_monitor::{init_logging, run, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    init_logging(&settings.log_level)?;

    info!("=== OBD Monitor v{} ===", env!("CARGO_PKG_VERSION"));
    run(settings).await
}
