//! The terminal-emulation buffer boundary.
//!
//! Escape-sequence parsing and rendering live outside this crate; a session
//! only needs somewhere to feed bytes and a way to resize retained history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Sink for a session's output stream.
///
/// `feed` is only ever invoked from the manager's serial queue, one call per
/// flush unit, in arrival order.
pub trait TerminalBuffer: Send + Sync {
    fn feed(&self, bytes: &[u8]);

    fn resize_history(&self, lines: usize);
}

/// Creates one buffer per session with the requested history size.
pub trait BufferFactory: Send + Sync {
    fn create(&self, key: &str, history_lines: usize) -> Arc<dyn TerminalBuffer>;
}

impl<F> BufferFactory for F
where
    F: Fn(&str, usize) -> Arc<dyn TerminalBuffer> + Send + Sync,
{
    fn create(&self, key: &str, history_lines: usize) -> Arc<dyn TerminalBuffer> {
        self(key, history_lines)
    }
}

/// Factory producing [`HistoryBuffer`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistoryBufferFactory;

impl BufferFactory for HistoryBufferFactory {
    fn create(&self, _key: &str, history_lines: usize) -> Arc<dyn TerminalBuffer> {
        Arc::new(HistoryBuffer::new(history_lines))
    }
}

// ---------------------------------------------------------------------------
// HistoryBuffer
// ---------------------------------------------------------------------------

/// Longest run without a newline kept as one line; longer runs wrap.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// In-memory transcript keeping at most `history_limit` complete lines plus
/// the trailing partial line. Bytes are stored verbatim.
pub struct HistoryBuffer {
    inner: Mutex<HistoryInner>,
}

struct HistoryInner {
    lines: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    limit: usize,
    feeds: usize,
}

impl HistoryInner {
    fn trim(&mut self) {
        while self.lines.len() > self.limit {
            self.lines.pop_front();
        }
    }
}

impl HistoryBuffer {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner {
                lines: VecDeque::new(),
                partial: Vec::new(),
                limit: history_limit,
                feeds: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("history buffer lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Retained bytes, including the trailing partial line.
    pub fn contents(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = Vec::new();
        for line in &inner.lines {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(&inner.partial);
        out
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Number of retained complete lines.
    pub fn line_count(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn history_limit(&self) -> usize {
        self.lock().limit
    }

    /// Number of `feed` calls received so far.
    pub fn feed_count(&self) -> usize {
        self.lock().feeds
    }
}

impl TerminalBuffer for HistoryBuffer {
    fn feed(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        inner.feeds += 1;
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let mut line = std::mem::take(&mut inner.partial);
            line.extend_from_slice(&rest[..=pos]);
            inner.lines.push_back(line);
            rest = &rest[pos + 1..];
        }
        inner.partial.extend_from_slice(rest);
        while inner.partial.len() > MAX_LINE_BYTES {
            let tail = inner.partial.split_off(MAX_LINE_BYTES);
            let line = std::mem::replace(&mut inner.partial, tail);
            inner.lines.push_back(line);
        }
        inner.trim();
    }

    fn resize_history(&self, lines: usize) {
        let mut inner = self.lock();
        inner.limit = lines;
        inner.trim();
    }
}

impl std::fmt::Debug for HistoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("HistoryBuffer")
            .field("lines", &inner.lines.len())
            .field("limit", &inner.limit)
            .field("feeds", &inner.feeds)
            .finish()
    }
}
