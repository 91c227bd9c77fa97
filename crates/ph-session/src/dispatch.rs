//! A single serialized execution context.
//!
//! Terminal-buffer feeds, flush timers and scrollback timers all run on one
//! dedicated thread in submission order, so anything they touch is only ever
//! mutated from that thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    RunAt {
        deadline: Instant,
        cancelled: Arc<AtomicBool>,
        job: Job,
    },
}

/// Cancellation handle for a job scheduled with [`SerialQueue::dispatch_after`].
///
/// Dropping the handle does not cancel the job.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cloneable handle to the queue thread. The thread exits once every handle
/// has been dropped and no timers remain.
#[derive(Clone)]
pub struct SerialQueue {
    tx: flume::Sender<Command>,
}

impl SerialQueue {
    /// Spawn the queue thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = flume::unbounded();
        let thread_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_queue(rx));
        if let Err(e) = spawned {
            // Jobs will be dropped on send; nothing else can be done here.
            error!(name = %thread_name, "failed to spawn serial queue thread: {e}");
        }
        Self { tx }
    }

    /// Run `job` on the queue after every previously submitted job.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Command::Run(Box::new(job))).is_err() {
            debug!("serial queue closed, dropping job");
        }
    }

    /// Run `job` on the queue once `delay` has elapsed, unless cancelled first.
    pub fn dispatch_after(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cmd = Command::RunAt {
            deadline: Instant::now() + delay,
            cancelled: Arc::clone(&cancelled),
            job: Box::new(job),
        };
        if self.tx.send(cmd).is_err() {
            debug!("serial queue closed, dropping timer");
        }
        TimerHandle { cancelled }
    }

    /// Block until every job submitted before this call has run.
    ///
    /// Must not be called from the queue thread itself.
    pub fn barrier(&self) {
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        self.dispatch(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("pending", &self.tx.len())
            .finish()
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl Scheduled {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run_queue(rx: flume::Receiver<Command>) {
    let mut timers: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        while timers.peek().is_some_and(Scheduled::is_cancelled) {
            timers.pop();
        }
        let next = match timers.peek() {
            Some(t) => rx.recv_deadline(t.deadline),
            None => rx.recv().map_err(|_| flume::RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(Command::Run(job)) => run_job(job),
            Ok(Command::RunAt {
                deadline,
                cancelled,
                job,
            }) => {
                seq += 1;
                // Re-armed debounce timers leave cancelled entries behind;
                // drop them now rather than at their deadline.
                timers.retain(|t| !t.is_cancelled());
                timers.push(Scheduled {
                    deadline,
                    seq,
                    cancelled,
                    job,
                });
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => {
                if timers.is_empty() {
                    break;
                }
                // Senders are gone but timers are still due; sleep until the
                // next one instead of spinning on a dead channel.
                if let Some(t) = timers.peek() {
                    std::thread::sleep(t.deadline.saturating_duration_since(Instant::now()));
                }
            }
        }

        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(t) = timers.pop() {
                if !t.cancelled.load(Ordering::Acquire) {
                    run_job(t.job);
                }
            }
        }
    }
    debug!("serial queue drained, exiting");
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("serial queue job panicked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
