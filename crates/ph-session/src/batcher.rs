//! Output batching between a PTY reader thread and the terminal buffer.
//!
//! Small chunks (echo of typed characters) go straight through; bulk output
//! is coalesced into one feed per flush. A flush always delivers the whole
//! pending queue as a single buffer, in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use ph_core::config::BatcherConfig;
use tracing::{trace, warn};

use crate::buffer::TerminalBuffer;
use crate::dispatch::{SerialQueue, TimerHandle};

/// Counters describing how chunks were routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Chunks delivered without queueing.
    pub immediate: u64,
    /// Chunks that went through the pending queue.
    pub batched: u64,
    /// Coalesced deliveries.
    pub flushes: u64,
}

#[derive(Default)]
struct Pending {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
    timer: Option<TimerHandle>,
    closed: bool,
}

struct Inner {
    config: BatcherConfig,
    queue: SerialQueue,
    sink: Arc<dyn TerminalBuffer>,
    pending: Mutex<Pending>,
    last_keystroke: Mutex<Option<Instant>>,
    immediate: AtomicU64,
    batched: AtomicU64,
    flushes: AtomicU64,
}

/// Per-session output batcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OutputBatcher {
    inner: Arc<Inner>,
}

impl OutputBatcher {
    pub fn new(config: BatcherConfig, queue: SerialQueue, sink: Arc<dyn TerminalBuffer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                sink,
                pending: Mutex::new(Pending::default()),
                last_keystroke: Mutex::new(None),
                immediate: AtomicU64::new(0),
                batched: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Record user input so the typing window opens.
    pub fn note_keystroke(&self) {
        *lock_or_recover(&self.inner.last_keystroke, "keystroke") = Some(Instant::now());
    }

    fn typing_active(&self) -> bool {
        lock_or_recover(&self.inner.last_keystroke, "keystroke")
            .is_some_and(|at| at.elapsed() <= self.inner.config.typing_window())
    }

    /// Route one chunk read from the PTY.
    pub fn push(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        let cfg = &self.inner.config;
        let typing = chunk.len() <= cfg.typing_max_bytes && self.typing_active();

        let mut pending = self.lock_pending();
        if pending.closed {
            return;
        }

        if pending.chunks.is_empty() && (chunk.len() <= cfg.immediate_max_bytes || typing) {
            self.inner.immediate.fetch_add(1, Ordering::Relaxed);
            trace!(bytes = chunk.len(), typing, "immediate delivery");
            self.deliver(chunk);
            return;
        }

        self.inner.batched.fetch_add(1, Ordering::Relaxed);
        pending.bytes += chunk.len();
        pending.chunks.push(chunk);

        // A typing-sized chunk behind queued output is flushed together with
        // it so echo is not held back by the timer and order is preserved.
        if typing || pending.chunks.len() >= cfg.max_queued_chunks {
            self.flush_locked(&mut pending);
        } else if pending.timer.is_none() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let timer = self.inner.queue.dispatch_after(cfg.flush_interval(), move || {
                if let Some(inner) = weak.upgrade() {
                    OutputBatcher { inner }.flush();
                }
            });
            pending.timer = Some(timer);
        }
    }

    /// Deliver everything queued so far as one feed.
    pub fn flush(&self) {
        let mut pending = self.lock_pending();
        self.flush_locked(&mut pending);
    }

    /// Flush remaining output and drop anything pushed afterwards.
    pub fn close(&self) {
        let mut pending = self.lock_pending();
        self.flush_locked(&mut pending);
        pending.closed = true;
    }

    pub fn pending_chunks(&self) -> usize {
        self.lock_pending().chunks.len()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            immediate: self.inner.immediate.load(Ordering::Relaxed),
            batched: self.inner.batched.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
        }
    }

    fn flush_locked(&self, pending: &mut Pending) {
        if let Some(timer) = pending.timer.take() {
            timer.cancel();
        }
        if pending.chunks.is_empty() {
            return;
        }
        let total = std::mem::take(&mut pending.bytes);
        let mut chunks = std::mem::take(&mut pending.chunks);
        let payload = if chunks.len() == 1 {
            chunks.pop().unwrap_or_default()
        } else {
            let mut joined = Vec::with_capacity(total);
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            joined
        };
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        trace!(bytes = payload.len(), "flushing batched output");
        self.deliver(payload);
    }

    // Called with the pending lock held so queue submission order matches
    // arrival order.
    fn deliver(&self, bytes: Vec<u8>) {
        let sink = Arc::clone(&self.inner.sink);
        self.inner.queue.dispatch(move || sink.feed(&bytes));
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        lock_or_recover(&self.inner.pending, "pending output")
    }
}

impl std::fmt::Debug for OutputBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBatcher")
            .field("pending_chunks", &self.pending_chunks())
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock_or_recover<'a, T>(m: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        feeds: Mutex<Vec<Vec<u8>>>,
    }

    impl TerminalBuffer for Recorder {
        fn feed(&self, bytes: &[u8]) {
            self.feeds.lock().unwrap().push(bytes.to_vec());
        }
        fn resize_history(&self, _lines: usize) {}
    }

    fn setup(config: BatcherConfig) -> (OutputBatcher, SerialQueue, Arc<Recorder>) {
        let queue = SerialQueue::new("batcher-test");
        let recorder = Arc::new(Recorder::default());
        let batcher = OutputBatcher::new(config, queue.clone(), recorder.clone());
        (batcher, queue, recorder)
    }

    fn slow_timer() -> BatcherConfig {
        BatcherConfig {
            flush_interval_ms: 60_000,
            ..BatcherConfig::default()
        }
    }

    #[test]
    fn small_chunk_on_empty_queue_is_immediate() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.push(b"a".to_vec());
        queue.barrier();
        assert_eq!(*rec.feeds.lock().unwrap(), vec![b"a".to_vec()]);
        assert_eq!(batcher.stats().immediate, 1);
        assert_eq!(batcher.pending_chunks(), 0);
    }

    #[test]
    fn typing_chunks_arrive_in_order() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.note_keystroke();
        let chunks = [b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()];
        for chunk in &chunks {
            batcher.push(chunk.clone());
        }
        queue.barrier();
        assert_eq!(*rec.feeds.lock().unwrap(), chunks.to_vec());
    }

    #[test]
    fn typing_window_bypasses_batching_for_mid_sized_chunks() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.note_keystroke();
        batcher.push(vec![b'x'; 400]);
        queue.barrier();
        assert_eq!(rec.feeds.lock().unwrap().len(), 1);
        assert_eq!(batcher.stats().immediate, 1);
    }

    #[test]
    fn mid_sized_chunk_without_typing_waits_for_timer() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.push(vec![b'x'; 400]);
        queue.barrier();
        assert!(rec.feeds.lock().unwrap().is_empty());
        assert_eq!(batcher.pending_chunks(), 1);
        batcher.flush();
        queue.barrier();
        assert_eq!(rec.feeds.lock().unwrap().len(), 1);
    }

    #[test]
    fn typing_chunk_behind_queue_flushes_everything_in_order() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.push(vec![b'a'; 1000]);
        batcher.note_keystroke();
        batcher.push(b"b".to_vec());
        queue.barrier();
        let feeds = rec.feeds.lock().unwrap();
        assert_eq!(feeds.len(), 1);
        let mut expected = vec![b'a'; 1000];
        expected.push(b'b');
        assert_eq!(feeds[0], expected);
    }

    #[test]
    fn queue_limit_forces_flush_and_loses_nothing() {
        let (batcher, queue, rec) = setup(slow_timer());
        let mut input = Vec::new();
        for i in 0..40u8 {
            let chunk = vec![i; 1000];
            input.extend_from_slice(&chunk);
            batcher.push(chunk);
        }
        queue.barrier();
        {
            let feeds = rec.feeds.lock().unwrap();
            assert_eq!(feeds.len(), 1, "expected one forced flush at 32 chunks");
            assert_eq!(feeds[0].len(), 32 * 1000);
        }
        assert_eq!(batcher.pending_chunks(), 8);

        batcher.flush();
        queue.barrier();
        let delivered: Vec<u8> = rec.feeds.lock().unwrap().concat();
        assert_eq!(delivered, input);
        assert_eq!(batcher.stats().flushes, 2);
    }

    #[test]
    fn timer_flushes_pending_output() {
        let (batcher, queue, rec) = setup(BatcherConfig {
            flush_interval_ms: 5,
            ..BatcherConfig::default()
        });
        batcher.push(vec![b'z'; 300]);
        batcher.push(vec![b'y'; 300]);
        std::thread::sleep(Duration::from_millis(100));
        queue.barrier();
        let feeds = rec.feeds.lock().unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].len(), 600);
        assert_eq!(batcher.pending_chunks(), 0);
    }

    #[test]
    fn closed_batcher_drops_late_output() {
        let (batcher, queue, rec) = setup(slow_timer());
        batcher.push(vec![b'q'; 200]);
        batcher.close();
        batcher.push(b"late".to_vec());
        queue.barrier();
        let feeds = rec.feeds.lock().unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0], vec![b'q'; 200]);
    }
}
