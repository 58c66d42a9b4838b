//! Response Framing
//!
//! ELM327 adapters terminate every reply with a `>` prompt and nothing else
//! reliably marks message boundaries. A single read may carry zero, one or
//! several replies plus the start of the next one, so bytes are accumulated
//! here and cut into frames at each prompt.

use std::fmt;

use tracing::warn;

/// Prompt character the adapter prints when it is ready for the next command
pub const PROMPT: char = '>';

/// Default cap on buffered bytes that have not yet seen a prompt
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Strip all whitespace and upper-case, the canonical form used for matching
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One complete, trimmed reply from the adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(String);

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whitespace-free, upper-case form of the frame
    pub fn normalized(&self) -> String {
        normalize(&self.0)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Result of feeding one read into the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Frames completed by this read, in arrival order (possibly none)
    Frames(Vec<Frame>),
    /// The read was empty: the stream has ended
    Closed,
}

/// Accumulates raw bytes and splits them into frames at each prompt
#[derive(Debug)]
pub struct ResponseFramer {
    pending: String,
    /// Received bytes held in `pending`; high bytes take two bytes of UTF-8
    pending_bytes: usize,
    max_pending: usize,
    closed: bool,
}

impl ResponseFramer {
    /// Create a framer that discards its pending bytes past `max_pending`
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: String::new(),
            pending_bytes: 0,
            max_pending,
            closed: false,
        }
    }

    /// Consume one read result.
    ///
    /// Bytes are decoded one char per byte (Latin-1). Everything up to the last
    /// prompt is split into frames; whitespace-only pieces between adjacent
    /// prompts are dropped. Bytes after the last prompt stay buffered until
    /// their own prompt arrives. An empty read closes the framer for good.
    pub fn feed(&mut self, bytes: &[u8]) -> Feed {
        if self.closed {
            return Feed::Closed;
        }
        if bytes.is_empty() {
            self.closed = true;
            self.pending.clear();
            self.pending_bytes = 0;
            return Feed::Closed;
        }

        self.pending.extend(bytes.iter().map(|&b| char::from(b)));
        self.pending_bytes += bytes.len();

        let mut frames = Vec::new();
        if let Some(last) = self.pending.rfind(PROMPT) {
            let remainder = self.pending.split_off(last + PROMPT.len_utf8());
            frames.extend(
                self.pending
                    .split(PROMPT)
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(Frame::new),
            );
            self.pending_bytes = remainder.chars().count();
            self.pending = remainder;
        }

        if self.pending_bytes > self.max_pending {
            warn!(
                pending = self.pending_bytes,
                max = self.max_pending,
                "No prompt within buffer limit, discarding pending bytes"
            );
            self.pending.clear();
            self.pending_bytes = 0;
        }

        Feed::Frames(frames)
    }

    /// Bytes received since the last prompt
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for ResponseFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
