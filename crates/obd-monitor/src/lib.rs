//! OBD-II Live Monitor
//!
//! Connects to an ELM327 adapter, runs the setup sequence and prints live
//! engine values until interrupted.

use anyhow::{anyhow, Context};
use obd_scheduler::{Monitor, PollSnapshot};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

pub mod settings;

pub use settings::{Settings, TransportKind};

/// Initialize logging at `level` (`trace` .. `error`)
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let level: Level = level
        .parse()
        .with_context(|| format!("Invalid log level '{level}'"))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// One line per cycle, e.g. `rpm: 1724 rpm | speed: 50 km/h | coolant_temp: --`
pub fn format_snapshot(snapshot: &PollSnapshot) -> String {
    snapshot
        .readings
        .iter()
        .map(|reading| match reading.value {
            Some(value) => format!("{}: {} {}", reading.pid, value, reading.pid.unit()),
            None => format!("{}: --", reading.pid),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Connect and print status changes and values until Ctrl-C.
///
/// Returns an error if the connection ends up in the error state.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let monitor = Monitor::new(settings.connector(), settings.monitor_config());
    let mut status = monitor.watch_status();
    let mut snapshots = monitor.watch_snapshot();

    info!(transport = ?settings.transport, target = %settings.target, "Starting monitor");
    monitor.connect(settings.target.clone());

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break Ok(());
            }
            changed = status.changed() => {
                changed.context("Monitor stopped")?;
                let text = status.borrow_and_update().clone();
                println!("{text}");
                if monitor.state().is_error() {
                    break Err(anyhow!("Connection lost: {text}"));
                }
            }
            changed = snapshots.changed() => {
                changed.context("Scheduler stopped")?;
                println!("{}", format_snapshot(&snapshots.borrow_and_update()));
            }
        }
    };

    monitor.disconnect().await;
    result
}
