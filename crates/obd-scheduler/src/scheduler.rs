//! Polling Scheduler Implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use obd_protocol::{Command, Correlator, Outcome, Pid};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the polling scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between two requests of the same cycle
    pub request_gap: Duration,
    /// Pause between the end of a cycle and the next one
    pub cycle_interval: Duration,
    /// Consecutive misses of one PID before a warning is logged
    pub failure_warn_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_gap: Duration::from_millis(50),
            cycle_interval: Duration::from_millis(500),
            failure_warn_threshold: 3,
        }
    }
}

/// Latest value of one PID; `None` when the last request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub pid: Pid,
    pub value: Option<i32>,
}

/// Results of one complete poll cycle, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSnapshot {
    /// Cycles completed since the scheduler was created; 0 before the first
    pub cycle: u64,
    pub readings: Vec<Reading>,
}

impl PollSnapshot {
    pub fn value(&self, pid: Pid) -> Option<i32> {
        self.readings
            .iter()
            .find(|reading| reading.pid == pid)
            .and_then(|reading| reading.value)
    }
}

/// Round-robin poller for a fixed set of PIDs.
///
/// Clones share the same scheduler. At most one poll loop runs at a time.
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    correlator: Correlator,
    config: SchedulerConfig,
    commands: Vec<(Pid, Command<i32>)>,
    values: HashMap<Pid, watch::Sender<Option<i32>>>,
    snapshot_tx: watch::Sender<PollSnapshot>,
    run: Mutex<Option<Run>>,
}

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollScheduler {
    /// Poll `pids` in the given order, one command each
    pub fn new(
        correlator: Correlator,
        pids: &[Pid],
        timeout: Duration,
        config: SchedulerConfig,
    ) -> Self {
        let commands = pids
            .iter()
            .map(|&pid| (pid, Command::pid(pid).with_timeout(timeout)))
            .collect();
        Self::with_commands(correlator, commands, config)
    }

    /// Poll arbitrary commands, each published under its PID
    pub fn with_commands(
        correlator: Correlator,
        commands: Vec<(Pid, Command<i32>)>,
        config: SchedulerConfig,
    ) -> Self {
        let values = commands
            .iter()
            .map(|(pid, _)| (*pid, watch::channel(None).0))
            .collect();
        info!(pids = commands.len(), "Poll scheduler created");

        Self {
            inner: Arc::new(Inner {
                correlator,
                config,
                commands,
                values,
                snapshot_tx: watch::channel(PollSnapshot::default()).0,
                run: Mutex::new(None),
            }),
        }
    }

    /// Start polling, cancelling any loop already running.
    ///
    /// The loop ends by itself when the session leaves `Connected`.
    pub async fn start(&self) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(cancel.clone()));
        let previous = self.inner.run.lock().replace(Run { cancel, handle });
        if let Some(previous) = previous {
            // Another start() raced this one
            previous.cancel.cancel();
        }
    }

    /// Stop polling and wait for the loop to finish
    pub async fn stop(&self) {
        let run = self.inner.run.lock().take();
        let Some(run) = run else {
            return;
        };
        run.cancel.cancel();
        if let Err(e) = run.handle.await {
            if e.is_panic() {
                error!(error = %e, "Poll loop panicked");
            }
        }
    }

    /// Stop polling without waiting for the loop, for `Drop` impls
    pub fn cancel(&self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// PIDs polled each cycle, in order
    pub fn pids(&self) -> Vec<Pid> {
        self.inner.commands.iter().map(|(pid, _)| *pid).collect()
    }

    /// Snapshot published at the end of every cycle
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Value of one PID, updated as soon as its reply is in
    pub fn watch_value(&self, pid: Pid) -> Option<watch::Receiver<Option<i32>>> {
        self.inner.values.get(&pid).map(watch::Sender::subscribe)
    }

    pub fn latest(&self, pid: Pid) -> Option<i32> {
        self.inner.values.get(&pid).and_then(|tx| *tx.borrow())
    }
}

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let session = self.correlator.session().clone();
        info!("Polling started");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => debug!("Polling cancelled"),
            _ = session.left_connected() => debug!("Session left Connected"),
            _ = self.poll_forever() => {}
        }
        info!("Polling stopped");
    }

    async fn poll_forever(&self) {
        let mut failures = vec![0u32; self.commands.len()];
        let mut cycle = self.snapshot_tx.borrow().cycle;

        loop {
            let mut readings = Vec::with_capacity(self.commands.len());
            for (i, (pid, command)) in self.commands.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(self.config.request_gap).await;
                }

                let outcome = command_outcome(&self.correlator, command).await;
                if !self.correlator.session().state().is_connected() {
                    return;
                }

                let value = outcome.into_value();
                if value.is_some() {
                    failures[i] = 0;
                } else {
                    failures[i] += 1;
                    if failures[i] == self.config.failure_warn_threshold {
                        warn!(pid = %pid, misses = failures[i], "PID keeps failing");
                    }
                }
                if let Some(tx) = self.values.get(pid) {
                    tx.send_replace(value);
                }
                readings.push(Reading { pid: *pid, value });
            }

            cycle += 1;
            debug!(cycle, "Poll cycle complete");
            self.snapshot_tx.send_replace(PollSnapshot { cycle, readings });
            tokio::time::sleep(self.config.cycle_interval).await;
        }
    }
}

async fn command_outcome(correlator: &Correlator, command: &Command<i32>) -> Outcome<i32> {
    let outcome = correlator.send(command).await;
    match &outcome {
        Outcome::Success { value, .. } => debug!(command = command.wire(), value, "Reading"),
        Outcome::ParseError { raw } => {
            warn!(command = command.wire(), reply = %raw, "Unreadable value")
        }
        Outcome::Timeout => warn!(command = command.wire(), "No reply"),
        Outcome::NotConnected => debug!(command = command.wire(), "Not connected"),
    }
    outcome
}
