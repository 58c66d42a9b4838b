//! Connection Session
//!
//! Owns the link to the adapter and drives the connection state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                  |                 |
//!                                  +--fail--> Error <+-- read/write failure
//! any --disconnect()--> Disconnected (an Error is kept until the next connect())
//! ```
//!
//! While connected, a read loop feeds the [`ResponseFramer`] and fans
//! completed frames out on a broadcast channel. Subscribers that fall behind
//! lose frames instead of stalling the read loop.
//!
//! Writes are bounded by a deadline and abandoned as soon as the connection
//! is cancelled. A write that misses its deadline is a transport failure.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::ObdError;
use crate::frame::{Feed, Frame, ResponseFramer, DEFAULT_MAX_PENDING};
use crate::state::ConnectionState;
use crate::transport::{BoxedLink, Connector};

/// Appended to every command on the wire
pub const LINE_TERMINATOR: char = '\r';

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Size of each read from the link
    pub read_chunk_size: usize,
    /// Framer buffer cap for bytes not yet terminated by a prompt
    pub max_pending_bytes: usize,
    /// Frames buffered per subscriber before it starts missing them
    pub frame_capacity: usize,
    /// Upper bound on a best-effort close of the link
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            max_pending_bytes: DEFAULT_MAX_PENDING,
            frame_capacity: 64,
            close_timeout: Duration::from_millis(500),
        }
    }
}

/// Handle to a connection session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    state_tx: watch::Sender<ConnectionState>,
    transitions_tx: broadcast::Sender<ConnectionState>,
    frames_tx: broadcast::Sender<Frame>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedLink>>>,
    worker: Mutex<Option<Worker>>,
}

/// The connect attempt and, once connected, the read loop
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions_tx, _) = broadcast::channel(32);
        let (frames_tx, _) = broadcast::channel(config.frame_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state_tx,
                transitions_tx,
                frames_tx,
                writer: tokio::sync::Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Read-only view of the latest state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every state transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions_tx.subscribe()
    }

    /// Frames completed after this call
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.inner.frames_tx.subscribe()
    }

    /// Number of live frame subscriptions
    pub fn frame_subscribers(&self) -> usize {
        self.inner.frames_tx.receiver_count()
    }

    /// Resolves once the session is not `Connected` (immediately if it isn't now)
    pub async fn left_connected(&self) {
        let mut state_rx = self.watch_state();
        let _ = state_rx.wait_for(|state| !state.is_connected()).await;
    }

    /// Start connecting to `target` in the background.
    ///
    /// Must be called within a Tokio runtime. A no-op (with a warning) while
    /// already connecting or connected.
    pub fn connect(&self, target: impl Into<String>) {
        let target = target.into();
        // Held until the worker is stored so disconnect() always finds it
        let mut worker = self.inner.worker.lock();
        let accepted = self.inner.transition(|state| {
            (!state.is_active()).then(|| ConnectionState::Connecting {
                target: target.clone(),
            })
        });
        if !accepted {
            drop(worker);
            warn!(%target, state = %self.state(), "Already connecting or connected");
            return;
        }

        info!(%target, "Connecting");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().drive(target, cancel.clone()));
        if let Some(stale) = worker.replace(Worker { cancel, handle }) {
            // Left over from a failed connection; it has already released the link
            stale.cancel.cancel();
        }
    }

    /// Cancel any connect attempt or read loop, release the link and settle
    /// into `Disconnected`. An `Error` state is preserved.
    pub async fn disconnect(&self) {
        debug!("Disconnecting");
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                if e.is_panic() {
                    error!(error = %e, "Connection task panicked");
                }
            }
        }

        self.inner.release().await;
        self.inner.transition(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Error { .. } => None,
            _ => Some(ConnectionState::Disconnected),
        });
        info!(state = %self.state(), "Disconnected");
    }

    /// Synchronous counterpart of [`Session::disconnect`], for `Drop` impls.
    ///
    /// Cancels the connection and settles the state right away without
    /// waiting for the worker. The link is dropped here unless a write holds
    /// it; that write is abandoned and the next connect replaces the link.
    pub fn close(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        self.inner.transition(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Error { .. } => None,
            _ => Some(ConnectionState::Disconnected),
        });
        debug!(state = %self.state(), "Session closed");
    }

    /// Write `text` followed by a carriage return, giving up after `timeout`.
    ///
    /// A failed or timed out write moves the session to `Error` and releases
    /// the link. Returns `NotConnected` if the connection is cancelled while
    /// waiting for the link or in the middle of the write.
    pub async fn send_line(&self, text: &str, timeout: Duration) -> Result<(), ObdError> {
        let Some(cancel) = self.inner.worker_token() else {
            return Err(ObdError::NotConnected);
        };
        let mut writer = tokio::select! {
            _ = cancel.cancelled() => return Err(ObdError::NotConnected),
            writer = self.inner.writer.lock() => writer,
        };
        if !self.state().is_connected() {
            return Err(ObdError::NotConnected);
        }
        let Some(link) = writer.as_mut() else {
            return Err(ObdError::NotConnected);
        };

        trace!(command = text, "Sending");
        let line = format!("{text}{LINE_TERMINATOR}");
        let write = async {
            link.write_all(line.as_bytes()).await?;
            link.flush().await
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(command = text, "Write abandoned, connection cancelled");
                return Err(ObdError::NotConnected);
            }
            result = tokio::time::timeout(timeout, write) => match result {
                Ok(written) => written.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            },
        };
        let Err(reason) = written else {
            return Ok(());
        };

        error!(command = text, error = %reason, "Write failed");
        if let Some(link) = writer.take() {
            self.inner.close(link).await;
        }
        drop(writer);

        cancel.cancel();
        let failure = ObdError::Write(reason);
        let message = failure.to_string();
        self.inner.transition(|state| {
            state.is_connected().then(|| ConnectionState::Error {
                message,
                target: None,
            })
        });
        Err(failure)
    }
}

impl Inner {
    /// Apply `next` to the current state; publishes and returns true if it
    /// produced a new state.
    fn transition(
        &self,
        next: impl FnOnce(&ConnectionState) -> Option<ConnectionState>,
    ) -> bool {
        self.state_tx.send_if_modified(|state| match next(state) {
            Some(new_state) => {
                debug!(from = %state, to = %new_state, "State transition");
                *state = new_state.clone();
                let _ = self.transitions_tx.send(new_state);
                true
            }
            None => false,
        })
    }

    fn worker_token(&self) -> Option<CancellationToken> {
        self.worker.lock().as_ref().map(|worker| worker.cancel.clone())
    }

    /// Like [`Inner::transition`], but ignored once `cancel` has fired so a
    /// cancelled task can never overwrite the state of a newer attempt.
    fn transition_unless_cancelled(
        &self,
        cancel: &CancellationToken,
        next: impl FnOnce(&ConnectionState) -> Option<ConnectionState>,
    ) -> bool {
        self.transition(|state| if cancel.is_cancelled() { None } else { next(state) })
    }

    async fn drive(self: Arc<Self>, target: String, cancel: CancellationToken) {
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%target, "Connect attempt cancelled");
                return;
            }
            result = self.connector.connect(&target) => result,
        };

        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                error!(%target, error = %e, "Connection failed");
                self.transition_unless_cancelled(&cancel, |_| {
                    Some(ConnectionState::Error {
                        message: format!("Connection failed: {e}"),
                        target: Some(target.clone()),
                    })
                });
                return;
            }
        };

        let (reader, writer) = tokio::io::split(link);
        {
            let mut slot = self.writer.lock().await;
            if cancel.is_cancelled() {
                debug!(%target, "Connect attempt cancelled");
                return;
            }
            *slot = Some(writer);
        }

        let entered = self.transition_unless_cancelled(&cancel, |state| {
            matches!(state, ConnectionState::Connecting { .. }).then(|| {
                ConnectionState::Connected {
                    target: target.clone(),
                }
            })
        });
        if !entered {
            debug!(%target, "Connection abandoned before it was entered");
            self.release().await;
            return;
        }

        info!(%target, "Connected");
        self.read_loop(reader, &cancel).await;
    }

    async fn read_loop(&self, mut reader: ReadHalf<BoxedLink>, cancel: &CancellationToken) {
        let mut framer = ResponseFramer::new(self.config.max_pending_bytes);
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];
        debug!("Read loop started");

        let failure = loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Read loop cancelled");
                    return;
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(n) => match framer.feed(&buf[..n]) {
                    Feed::Frames(frames) => {
                        for frame in frames {
                            trace!(%frame, "Frame received");
                            // No subscribers is fine: nobody is waiting for a reply
                            let _ = self.frames_tx.send(frame);
                        }
                    }
                    Feed::Closed => {
                        warn!("Input stream ended, adapter disconnected");
                        break ObdError::ConnectionClosed;
                    }
                },
                Err(e) => {
                    error!(error = %e, "Read failed");
                    break ObdError::Read(e.to_string());
                }
            }
        };

        self.release().await;
        self.transition_unless_cancelled(cancel, |state| {
            state.is_connected().then(|| ConnectionState::Error {
                message: failure.to_string(),
                target: None,
            })
        });
        debug!("Read loop stopped");
    }

    /// Drop the write half, closing it first on a best-effort basis
    async fn release(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(link) = writer {
            self.close(link).await;
        }
    }

    async fn close(&self, mut link: WriteHalf<BoxedLink>) {
        match tokio::time::timeout(self.config.close_timeout, link.shutdown()).await {
            Ok(Ok(())) => debug!("Link closed"),
            Ok(Err(e)) => debug!(error = %e, "Ignoring error while closing link"),
            Err(_) => debug!("Timed out closing link"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(2);

    async fn wait_for_state(
        session: &Session,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = session.watch_state();
        let state = tokio::time::timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("state not reached in time")
            .expect("state channel closed")
            .clone();
        state
    }

    fn manual_session() -> (Session, tokio::sync::mpsc::UnboundedReceiver<DuplexStream>) {
        let (connector, devices) = MockConnector::manual();
        (Session::new(Arc::new(connector), SessionConfig::default()), devices)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let session = Session::new(Arc::new(MockConnector::elm327()), SessionConfig::default());
        let mut transitions = session.subscribe_transitions();
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let target = "mock".to_string();
        assert_eq!(
            transitions.recv().await.unwrap(),
            ConnectionState::Connecting { target: target.clone() }
        );
        assert_eq!(
            transitions.recv().await.unwrap(),
            ConnectionState::Connected { target }
        );
        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice_starts_one_attempt() {
        let connector = Arc::new(
            MockConnector::elm327().with_connect_delay(Duration::from_millis(50)),
        );
        let session = Session::new(connector.clone(), SessionConfig::default());

        session.connect("mock");
        session.connect("mock");
        assert!(matches!(session.state(), ConnectionState::Connecting { .. }));

        wait_for_state(&session, ConnectionState::is_connected).await;
        session.connect("mock");
        assert_eq!(connector.connect_attempts(), 1);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error_with_target() {
        let session = Session::new(
            Arc::new(MockConnector::elm327().failing("adapter unreachable")),
            SessionConfig::default(),
        );
        session.connect("/dev/rfcomm0");

        let state = wait_for_state(&session, ConnectionState::is_error).await;
        assert_eq!(
            state,
            ConnectionState::Error {
                message: "Connection failed: I/O error: adapter unreachable".into(),
                target: Some("/dev/rfcomm0".into()),
            }
        );

        // disconnect() keeps the error visible
        session.disconnect().await;
        assert!(session.state().is_error());
    }

    #[tokio::test]
    async fn test_connect_allowed_after_error() {
        let connector = Arc::new(MockConnector::elm327().failing("refused"));
        let session = Session::new(connector.clone(), SessionConfig::default());
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_error).await;

        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_error).await;
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let session = Session::new(
            Arc::new(MockConnector::elm327().with_connect_delay(Duration::from_secs(30))),
            SessionConfig::default(),
        );
        session.connect("mock");
        tokio::time::timeout(WAIT, session.disconnect())
            .await
            .expect("disconnect should not wait for the connect attempt");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_frames_fan_out_to_all_subscribers() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let mut device = devices.recv().await.unwrap();

        let mut first = session.subscribe_frames();
        let mut second = session.subscribe_frames();
        device.write_all(b"OK>41 0C 00 00>").await.unwrap();

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap(), Frame::from("OK"));
            assert_eq!(rx.recv().await.unwrap(), Frame::from("41 0C 00 00"));
        }
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_misses_frames_without_blocking() {
        let (connector, mut devices) = MockConnector::manual();
        let config = SessionConfig {
            frame_capacity: 2,
            ..SessionConfig::default()
        };
        let session = Session::new(Arc::new(connector), config);
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let mut device = devices.recv().await.unwrap();

        let mut slow = session.subscribe_frames();
        let mut fast = session.subscribe_frames();
        device.write_all(b"A>B>C>D>").await.unwrap();

        // The read loop keeps going while `slow` is not reading
        let mut last = None;
        while last.as_deref() != Some("D") {
            match tokio::time::timeout(WAIT, fast.recv()).await.unwrap() {
                Ok(frame) => last = Some(frame.to_string()),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("unexpected {e}"),
            }
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_stream_end_sets_error_and_releases_link() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let device = devices.recv().await.unwrap();

        drop(device);
        let state = wait_for_state(&session, ConnectionState::is_error).await;
        assert_eq!(
            state,
            ConnectionState::Error {
                message: "Device disconnected".into(),
                target: None,
            }
        );
        assert!(matches!(
            session.send_line("010C", WAIT).await,
            Err(ObdError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_line_appends_carriage_return() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let mut device = devices.recv().await.unwrap();

        session.send_line("ATE0", WAIT).await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ATE0\r");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_fails_connection() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        // Kept open but never read, so the link buffer fills up
        let _device = devices.recv().await.unwrap();

        let line = "A".repeat(8 * 1024);
        let sent = session.send_line(&line, Duration::from_millis(100));
        let sent = tokio::time::timeout(WAIT, sent)
            .await
            .expect("write should give up at its deadline");
        assert!(matches!(sent, Err(ObdError::Write(_))));
        assert_eq!(
            session.state(),
            ConnectionState::Error {
                message: "Write error: timed out after 100ms".into(),
                target: None,
            }
        );

        tokio::time::timeout(WAIT, session.disconnect())
            .await
            .expect("disconnect should not wait for the stalled write");
        assert!(session.state().is_error());
    }

    #[tokio::test]
    async fn test_disconnect_abandons_stalled_write() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let _device = devices.recv().await.unwrap();

        let writing = tokio::spawn({
            let session = session.clone();
            async move {
                let line = "A".repeat(8 * 1024);
                session.send_line(&line, Duration::from_secs(30)).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(WAIT, session.disconnect())
            .await
            .expect("disconnect should cancel the stalled write");
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let sent = tokio::time::timeout(WAIT, writing).await.unwrap().unwrap();
        assert!(matches!(sent, Err(ObdError::NotConnected)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_right_after_connect_releases_link() {
        let (session, mut devices) = manual_session();
        for _ in 0..20 {
            session.connect("mock");
            session.disconnect().await;
            assert_eq!(session.state(), ConnectionState::Disconnected);
        }

        // Every link that was opened has been dropped on our side
        while let Ok(mut device) = devices.try_recv() {
            let mut buf = [0u8; 16];
            let n = tokio::time::timeout(WAIT, device.read(&mut buf))
                .await
                .expect("link still held")
                .unwrap();
            assert_eq!(n, 0);
        }

        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_close_settles_state_without_waiting() {
        let (session, mut devices) = manual_session();
        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let mut device = devices.recv().await.unwrap();

        session.close();
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(WAIT, device.read(&mut buf))
            .await
            .expect("link should be dropped once the read loop stops")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_send_line_requires_connection() {
        let (session, _devices) = manual_session();
        assert!(matches!(
            session.send_line("010C", WAIT).await,
            Err(ObdError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_left_connected_resolves_on_disconnect() {
        let session = Session::new(Arc::new(MockConnector::elm327()), SessionConfig::default());
        session.left_connected().await;

        session.connect("mock");
        wait_for_state(&session, ConnectionState::is_connected).await;
        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.left_connected().await }
        });
        session.disconnect().await;
        tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    }
}
