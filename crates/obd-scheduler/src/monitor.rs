//! Connection supervisor
//!
//! Ties the adapter setup and the poll loop to the connection lifecycle:
//! every time the session enters `Connected` the init sequence runs and
//! polling starts after it; leaving `Connected` stops both. Init and polling
//! never overlap, so there is never more than one command in flight.

use std::sync::Arc;
use std::time::Duration;

use obd_protocol::command::DEFAULT_TIMEOUT;
use obd_protocol::{
    ConnectionState, Connector, Correlator, InitConfig, InitSequencer, Pid, Session,
    SessionConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::scheduler::{PollScheduler, PollSnapshot, SchedulerConfig};

/// Everything the monitor needs to run a connection
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub session: SessionConfig,
    pub init: InitConfig,
    pub scheduler: SchedulerConfig,
    /// PIDs polled each cycle, in order
    pub pids: Vec<Pid>,
    /// Reply deadline for data requests
    pub command_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            init: InitConfig::default(),
            scheduler: SchedulerConfig::default(),
            pids: vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp],
            command_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A session with init and polling driven by its state
pub struct Monitor {
    session: Session,
    scheduler: PollScheduler,
    status_rx: watch::Receiver<String>,
    supervisor: JoinHandle<()>,
}

impl Monitor {
    /// Must be called within a Tokio runtime
    pub fn new(connector: Arc<dyn Connector>, config: MonitorConfig) -> Self {
        let session = Session::new(connector, config.session);
        let correlator = Correlator::new(session.clone());
        let scheduler = PollScheduler::new(
            correlator.clone(),
            &config.pids,
            config.command_timeout,
            config.scheduler,
        );
        let (status_tx, status_rx) = watch::channel(session.state().status_text());

        let supervisor = Supervisor {
            correlator,
            init: InitSequencer::new(config.init),
            scheduler: scheduler.clone(),
            status_tx,
            bring_up: None,
        };
        let transitions = session.subscribe_transitions();
        let supervisor = tokio::spawn(supervisor.run(transitions));

        Self {
            session,
            scheduler,
            status_rx,
            supervisor,
        }
    }

    pub fn connect(&self, target: impl Into<String>) {
        self.session.connect(target);
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    /// Human-readable status line, e.g. `Status: Connected to /dev/rfcomm0`
    pub fn watch_status(&self) -> watch::Receiver<String> {
        self.status_rx.clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<PollSnapshot> {
        self.scheduler.subscribe()
    }

    /// `None` if `pid` is not polled
    pub fn watch_value(&self, pid: Pid) -> Option<watch::Receiver<Option<i32>>> {
        self.scheduler.watch_value(pid)
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.scheduler.cancel();
        self.session.close();
    }
}

struct Supervisor {
    correlator: Correlator,
    init: InitSequencer,
    scheduler: PollScheduler,
    status_tx: watch::Sender<String>,
    bring_up: Option<BringUp>,
}

/// Init followed by the start of polling, for one connection.
/// Cancelled when dropped, including when the supervisor is aborted.
struct BringUp {
    cancel: DropGuard,
    handle: JoinHandle<()>,
}

impl Supervisor {
    async fn run(mut self, mut transitions: broadcast::Receiver<ConnectionState>) {
        loop {
            let state = match transitions.recv().await {
                Ok(state) => state,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed state transitions, resyncing");
                    self.correlator.session().state()
                }
                Err(RecvError::Closed) => break,
            };

            let status = state.status_text();
            info!(%status, "Connection status");
            self.status_tx.send_replace(status);

            self.stop().await;
            if let ConnectionState::Connected { target } = &state {
                debug!(%target, "Starting adapter bring-up");
                self.start();
            }
        }
        self.stop().await;
    }

    fn start(&mut self) {
        let cancel = CancellationToken::new();
        let correlator = self.correlator.clone();
        let init = self.init.clone();
        let scheduler = self.scheduler.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Bring-up cancelled"),
                result = init.run(&correlator) => match result {
                    Ok(_) => scheduler.start().await,
                    Err(e) => warn!(error = %e, "Adapter initialization failed"),
                },
            }
        });
        self.bring_up = Some(BringUp {
            cancel: cancel.drop_guard(),
            handle,
        });
    }

    async fn stop(&mut self) {
        if let Some(BringUp { cancel, handle }) = self.bring_up.take() {
            drop(cancel);
            let _ = handle.await;
        }
        self.scheduler.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::transport::mock::MockConnector;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            init: InitConfig {
                pacing: Duration::from_millis(1),
                command_timeout: Duration::from_millis(100),
                ..InitConfig::default()
            },
            scheduler: SchedulerConfig {
                request_gap: Duration::from_millis(1),
                cycle_interval: Duration::from_millis(10),
                failure_warn_threshold: 2,
            },
            command_timeout: Duration::from_millis(100),
            ..MonitorConfig::default()
        }
    }

    async fn next_snapshot(rx: &mut watch::Receiver<PollSnapshot>) -> PollSnapshot {
        tokio::time::timeout(WAIT, rx.changed()).await.unwrap().unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_connect_runs_init_then_polls() {
        let monitor = Monitor::new(Arc::new(MockConnector::elm327()), fast_config());
        let mut snapshots = monitor.watch_snapshot();
        let mut rpm = monitor.watch_value(Pid::Rpm).unwrap();
        monitor.connect("mock");

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.value(Pid::Rpm), Some(1724));
        assert_eq!(snapshot.value(Pid::Speed), Some(50));
        assert_eq!(snapshot.value(Pid::CoolantTemp), Some(50));
        assert_eq!(*rpm.borrow_and_update(), Some(1724));
        assert!(monitor.watch_value(Pid::ThrottlePosition).is_none());

        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn test_status_text_follows_state() {
        let monitor = Monitor::new(Arc::new(MockConnector::elm327()), fast_config());
        let mut status = monitor.watch_status();
        assert_eq!(*status.borrow_and_update(), "Status: Disconnected");

        monitor.connect("/dev/rfcomm0");
        tokio::time::timeout(
            WAIT,
            status.wait_for(|text| text == "Status: Connected to /dev/rfcomm0"),
        )
        .await
        .unwrap()
        .unwrap();

        monitor.disconnect().await;
        tokio::time::timeout(WAIT, status.wait_for(|text| text == "Status: Disconnected"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_status_names_target() {
        let connector = MockConnector::elm327().failing("no adapter");
        let monitor = Monitor::new(Arc::new(connector), fast_config());
        let mut status = monitor.watch_status();
        monitor.connect("10.0.0.1:35000");

        let text = tokio::time::timeout(WAIT, status.wait_for(|text| text.contains("Error")))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(
            text,
            "Status: Error - Connection failed: I/O error: no adapter (10.0.0.1:35000)"
        );
    }

    #[tokio::test]
    async fn test_double_connect_single_attempt() {
        let connector = Arc::new(
            MockConnector::elm327().with_connect_delay(Duration::from_millis(50)),
        );
        let monitor = Monitor::new(connector.clone(), fast_config());
        let mut snapshots = monitor.watch_snapshot();

        monitor.connect("mock");
        monitor.connect("mock");
        next_snapshot(&mut snapshots).await;
        assert_eq!(connector.connect_attempts(), 1);

        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_cycle_stops_publishing() {
        let connector = MockConnector::elm327().with_latency(Duration::from_millis(30));
        let mut config = fast_config();
        config.command_timeout = Duration::from_millis(500);
        let monitor = Monitor::new(Arc::new(connector), config);
        let mut snapshots = monitor.watch_snapshot();
        let mut speed = monitor.watch_value(Pid::Speed).unwrap();

        monitor.connect("mock");
        next_snapshot(&mut snapshots).await;

        // Rpm reply of the next cycle is in flight
        let mut rpm = monitor.watch_value(Pid::Rpm).unwrap();
        tokio::time::timeout(WAIT, rpm.changed()).await.unwrap().unwrap();
        speed.borrow_and_update();
        monitor.disconnect().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!monitor.scheduler().is_running());
        assert!(!snapshots.has_changed().unwrap());
        assert!(!speed.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_silent_pid_reads_as_unavailable() {
        let connector = MockConnector::elm327().with_silence("010D");
        let monitor = Monitor::new(Arc::new(connector), fast_config());
        let mut snapshots = monitor.watch_snapshot();
        monitor.connect("mock");

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.value(Pid::Rpm), Some(1724));
        assert_eq!(snapshot.value(Pid::Speed), None);
        assert!(monitor.state().is_connected());

        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn test_failed_init_disconnects_without_polling() {
        let connector = MockConnector::elm327()
            .with_silence("ATZ")
            .with_silence("ATE0")
            .with_silence("ATL0");
        let monitor = Monitor::new(Arc::new(connector), fast_config());
        let mut state = monitor.watch_state();
        monitor.connect("mock");

        tokio::time::timeout(WAIT, state.wait_for(ConnectionState::is_connected))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.watch_snapshot().borrow().cycle, 0);
    }

    #[tokio::test]
    async fn test_drop_closes_session_and_stops_polling() {
        let monitor = Monitor::new(Arc::new(MockConnector::elm327()), fast_config());
        let session = monitor.session().clone();
        let scheduler = monitor.scheduler().clone();
        let mut snapshots = monitor.watch_snapshot();
        monitor.connect("mock");
        next_snapshot(&mut snapshots).await;

        drop(monitor);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let mut frames = session.subscribe_frames();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            frames.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!scheduler.is_running());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_restarts_polling() {
        let monitor = Monitor::new(Arc::new(MockConnector::elm327()), fast_config());
        let mut snapshots = monitor.watch_snapshot();

        monitor.connect("mock");
        next_snapshot(&mut snapshots).await;
        monitor.disconnect().await;

        monitor.connect("mock");
        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.value(Pid::Rpm), Some(1724));
        monitor.disconnect().await;
    }
}
