//! Mock ELM327 adapter for testing
//!
//! Emulates an adapter over an in-memory duplex stream. Commands are looked up
//! in a reply table after normalization; unknown commands get `?` like a real
//! adapter. Echo is on after `ATZ` and toggled by `ATE0`/`ATE1`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::trace;

use super::{BoxedLink, Connector};
use crate::error::ObdError;
use crate::frame::normalize;

const LINK_BUFFER: usize = 4096;

/// `None` means the adapter stays silent for that command
type ReplyTable = HashMap<String, Option<String>>;

/// Connector that spawns an emulated adapter per connection
pub struct MockConnector {
    replies: Arc<RwLock<ReplyTable>>,
    echo: bool,
    latency: Duration,
    connect_delay: Duration,
    connect_error: Option<String>,
    attempts: Arc<AtomicUsize>,
    devices: Option<mpsc::UnboundedSender<DuplexStream>>,
}

impl MockConnector {
    /// Emulated adapter with replies for the setup sequence and the common PIDs
    pub fn elm327() -> Self {
        Self {
            replies: Arc::new(RwLock::new(Self::default_replies())),
            echo: true,
            latency: Duration::ZERO,
            connect_delay: Duration::ZERO,
            connect_error: None,
            attempts: Arc::new(AtomicUsize::new(0)),
            devices: None,
        }
    }

    /// No emulation: the adapter end of every link is handed to the receiver
    pub fn manual() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            devices: Some(tx),
            ..Self::elm327()
        };
        (connector, rx)
    }

    /// Reply with `reply` when `command` is received
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.set_reply(command, reply);
        self
    }

    /// Never answer `command`
    pub fn with_silence(self, command: &str) -> Self {
        self.silence(command);
        self
    }

    /// Initial echo setting (restored on `ATZ`)
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Delay before each reply
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay before `connect` resolves
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make every connect attempt fail with `message`
    pub fn failing(mut self, message: &str) -> Self {
        self.connect_error = Some(message.to_string());
        self
    }

    /// Change a reply on live connections
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.replies
            .write()
            .insert(normalize(command), Some(reply.to_string()));
    }

    /// Stop answering a command on live connections
    pub fn silence(&self, command: &str) {
        self.replies.write().insert(normalize(command), None);
    }

    /// Number of `connect` calls so far
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn default_replies() -> ReplyTable {
        [
            ("ATZ", "ELM327 v1.5"),
            ("ATE0", "OK"),
            ("ATE1", "OK"),
            ("ATL0", "OK"),
            ("ATH0", "OK"),
            ("ATS0", "OK"),
            ("ATSP0", "OK"),
            // 0x1AF0 -> 1724 rpm
            ("010C", "41 0C 1A F0"),
            // 50 km/h
            ("010D", "41 0D 32"),
            // 0x5A - 40 = 50°C
            ("0105", "41 05 5A"),
        ]
        .into_iter()
        .map(|(command, reply)| (command.to_string(), Some(reply.to_string())))
        .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &str) -> Result<BoxedLink, ObdError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(message) = &self.connect_error {
            return Err(ObdError::Io(message.clone()));
        }

        let (link, device) = tokio::io::duplex(LINK_BUFFER);
        match &self.devices {
            Some(devices) => devices
                .send(device)
                .map_err(|_| ObdError::Io("mock device receiver dropped".to_string()))?,
            None => {
                let adapter = EmulatedAdapter {
                    replies: self.replies.clone(),
                    default_echo: self.echo,
                    echo: self.echo,
                    latency: self.latency,
                };
                tokio::spawn(adapter.run(device));
            }
        }

        trace!(target, "Mock link opened");
        Ok(Box::new(link))
    }
}

struct EmulatedAdapter {
    replies: Arc<RwLock<ReplyTable>>,
    default_echo: bool,
    echo: bool,
    latency: Duration,
}

impl EmulatedAdapter {
    async fn run(mut self, device: DuplexStream) {
        let (mut rx, mut tx) = tokio::io::split(device);
        let mut line = String::new();
        let mut buf = [0u8; 256];

        loop {
            let n = match rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte != b'\r' {
                    line.push(char::from(byte));
                    continue;
                }
                let Some(output) = self.respond(&line) else {
                    line.clear();
                    continue;
                };
                line.clear();
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                if tx.write_all(output.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
        trace!("Mock adapter stopped");
    }

    /// Bytes written back for one command line, `None` when silent
    fn respond(&mut self, line: &str) -> Option<String> {
        let command = normalize(line);
        if command.is_empty() {
            return None;
        }

        let reply = match self.replies.read().get(&command) {
            Some(Some(reply)) => reply.clone(),
            Some(None) => return None,
            None => "?".to_string(),
        };

        let echoed = if self.echo { format!("{line}\r") } else { String::new() };
        match command.as_str() {
            "ATZ" => self.echo = self.default_echo,
            "ATE0" => self.echo = false,
            "ATE1" => self.echo = true,
            _ => {}
        }

        Some(format!("{echoed}{reply}\r\r>"))
    }
}
