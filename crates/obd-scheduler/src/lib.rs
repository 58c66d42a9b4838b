//! OBD-II Polling and Supervision
//!
//! Polls a fixed set of PIDs round-robin while the session is connected and
//! publishes the latest values. [`Monitor`] runs the adapter setup on every
//! new connection and starts polling once it is done.

mod monitor;
mod scheduler;

pub use monitor::{Monitor, MonitorConfig};
pub use scheduler::{PollScheduler, PollSnapshot, Reading, SchedulerConfig};
