//! One PTY-backed child process wired to a terminal buffer through an
//! output batcher.

use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ph_core::config::{Config, TeardownConfig};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::OutputBatcher;
use crate::buffer::TerminalBuffer;
use crate::dispatch::SerialQueue;
use crate::error::{Result, SessionError};
use crate::process_tree;

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

// ---------------------------------------------------------------------------
// Launch description
// ---------------------------------------------------------------------------

/// Fully resolved process launch: program, arguments, working directory,
/// environment and initial PTY size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Delivered once when the child's output stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub session_id: Uuid,
    pub pid: u32,
    pub exit_code: Option<u32>,
}

/// Outcome of a synchronous graduated shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub pid: u32,
    /// The process exited within the grace window.
    pub graceful: bool,
    /// SIGKILL and the process tree killer were needed.
    pub escalated: bool,
    /// Pids signalled by the process tree killer.
    pub tree_killed: usize,
    /// The process was reaped before teardown returned.
    pub reaped: bool,
    pub exit_code: Option<u32>,
}

/// Bytes written to the PTY for `command`: any trailing newline is replaced
/// by the carriage return a terminal sends for Enter.
pub fn command_input(command: &str) -> Vec<u8> {
    let mut bytes = command
        .trim_end_matches(['\n', '\r'])
        .as_bytes()
        .to_vec();
    bytes.push(b'\r');
    bytes
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    id: Uuid,
    pid: u32,
    program: String,
    started_at: DateTime<Utc>,
    console_mode: AtomicBool,
    running: Arc<AtomicBool>,
    torn_down: AtomicBool,
    buffer: Arc<dyn TerminalBuffer>,
    batcher: OutputBatcher,
    queue: SerialQueue,
    writer: Mutex<Option<flume::Sender<Vec<u8>>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: SharedChild,
    termination: Mutex<Option<flume::Receiver<Termination>>>,
    teardown: TeardownConfig,
}

impl Session {
    /// Spawn `launch` inside a new PTY and start its reader and writer threads.
    ///
    /// Output is routed through an [`OutputBatcher`] whose feeds run on `queue`.
    pub fn spawn(
        launch: &LaunchSpec,
        buffer: Arc<dyn TerminalBuffer>,
        queue: SerialQueue,
        config: &Config,
        console_mode: bool,
    ) -> Result<Arc<Self>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: launch.rows,
                cols: launch.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(format!("openpty failed: {e}")))?;

        let mut command = CommandBuilder::new(&launch.program);
        for arg in &launch.args {
            command.arg(arg);
        }
        if let Some(cwd) = &launch.cwd {
            command.cwd(cwd);
        }
        for (k, v) in &launch.env {
            command.env(k, v);
        }

        let spawn_failed = |reason: String| SessionError::SpawnFailed {
            program: launch.program.clone(),
            reason,
        };

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| spawn_failed(e.to_string()))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let child: SharedChild = Arc::new(Mutex::new(child));
        let pid = lock_child(&child).process_id();
        let Some(pid) = pid else {
            let _ = lock_child(&child).kill();
            return Err(spawn_failed("child has no process id".into()));
        };

        let id = Uuid::new_v4();
        let running = Arc::new(AtomicBool::new(true));
        let batcher = OutputBatcher::new(config.batcher.clone(), queue.clone(), Arc::clone(&buffer));
        let (term_tx, term_rx) = flume::bounded::<Termination>(1);

        // -- stdout reader thread --
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(format!("clone reader: {e}")))?;
        {
            let batcher = batcher.clone();
            let running = Arc::clone(&running);
            let child = Arc::clone(&child);
            let settle = config.teardown.settle();
            let poll = config.teardown.poll_interval();
            std::thread::Builder::new()
                .name(format!("ph-pty-read-{pid}"))
                .spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => batcher.push(buf[..n].to_vec()),
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                // EIO is the normal end-of-stream on macOS and Linux.
                                debug!(pid, "pty reader stopped: {e}");
                                break;
                            }
                        }
                    }
                    running.store(false, Ordering::Release);
                    batcher.close();
                    let exit_code = poll_exit(&child, settle, poll);
                    let _ = term_tx.send(Termination {
                        session_id: id,
                        pid,
                        exit_code,
                    });
                })?;
        }

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(format!("take writer: {e}")))?;
        std::thread::Builder::new()
            .name(format!("ph-pty-write-{pid}"))
            .spawn(move || {
                while let Ok(data) = write_rx.recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            })?;

        info!(pid, program = %launch.program, console_mode, "spawned PTY session");

        Ok(Arc::new(Self {
            id,
            pid,
            program: launch.program.clone(),
            started_at: Utc::now(),
            console_mode: AtomicBool::new(console_mode),
            running,
            torn_down: AtomicBool::new(false),
            buffer,
            batcher,
            queue,
            writer: Mutex::new(Some(write_tx)),
            master: Mutex::new(Some(pair.master)),
            child,
            termination: Mutex::new(Some(term_rx)),
            teardown: config.teardown.clone(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn console_mode(&self) -> bool {
        self.console_mode.load(Ordering::Acquire)
    }

    pub fn set_console_mode(&self, console_mode: bool) {
        self.console_mode.store(console_mode, Ordering::Release);
    }

    /// False once the output stream ended or teardown began.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &Arc<dyn TerminalBuffer> {
        &self.buffer
    }

    pub fn batcher(&self) -> &OutputBatcher {
        &self.batcher
    }

    /// The exit signal; the first caller receives it, later callers get `None`.
    pub fn take_termination(&self) -> Option<flume::Receiver<Termination>> {
        lock(&self.termination, "termination").take()
    }

    /// Write raw bytes to the process input. Ignored once not running.
    pub fn send(&self, bytes: &[u8]) {
        if !self.is_running() || bytes.is_empty() {
            return;
        }
        self.batcher.note_keystroke();
        let writer = lock(&self.writer, "writer");
        if let Some(tx) = writer.as_ref() {
            if tx.send(bytes.to_vec()).is_err() {
                debug!(pid = self.pid, "writer closed, dropping input");
            }
        }
    }

    pub fn send_text(&self, text: &str) {
        self.send(text.as_bytes());
    }

    /// Send `command` followed by a carriage return.
    pub fn execute(&self, command: &str) {
        self.send(&command_input(command));
    }

    /// Propagate a new window size to the PTY. Ignored once not running.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !self.is_running() {
            return;
        }
        let master = lock(&self.master, "master");
        if let Some(master) = master.as_ref() {
            let size = PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            };
            match master.resize(size) {
                Ok(()) => debug!(pid = self.pid, cols, rows, "PTY resized"),
                Err(e) => debug!(pid = self.pid, "resize failed: {e}"),
            }
        }
    }

    /// Resize the buffer's retained history on the delivery queue.
    pub fn resize_history(&self, lines: usize) {
        let buffer = Arc::clone(&self.buffer);
        self.queue.dispatch(move || buffer.resize_history(lines));
    }

    /// Whether the child has not exited yet. Reaps it if it has.
    pub fn is_alive(&self) -> bool {
        matches!(lock_child(&self.child).try_wait(), Ok(None))
    }

    /// Graduated shutdown. SIGTERM to the process group and PTY close happen
    /// on the calling thread; the grace wait, escalation and reaping happen
    /// here when `blocking`, otherwise on a background thread.
    ///
    /// Returns `None` when not blocking or when teardown already ran.
    pub fn terminate(&self, blocking: bool) -> Option<TeardownReport> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.running.store(false, Ordering::Release);
        self.batcher.close();

        // Once reaped the pid may belong to someone else; never signal it.
        let reaped = matches!(lock_child(&self.child).try_wait(), Ok(Some(_)));
        let pgid = if reaped {
            None
        } else {
            let pgid = process_tree::process_group_of(self.pid);
            if let Err(e) = process_tree::signal_group_or_pid(self.pid, pgid, libc::SIGTERM) {
                debug!(pid = self.pid, "SIGTERM failed: {e}");
            }
            pgid
        };
        lock(&self.writer, "writer").take();
        lock(&self.master, "master").take();
        // The reader thread still holds a master descriptor, so releasing
        // ours does not hang up the terminal. Deliver the hangup directly.
        if !reaped {
            if let Err(e) = process_tree::signal_group_or_pid(self.pid, pgid, libc::SIGHUP) {
                debug!(pid = self.pid, "SIGHUP failed: {e}");
            }
        }

        let reaper = Reaper {
            pid: self.pid,
            pgid,
            child: Arc::clone(&self.child),
            config: self.teardown.clone(),
        };
        if blocking {
            return Some(reaper.run());
        }
        let spawned = std::thread::Builder::new()
            .name(format!("ph-teardown-{}", self.pid))
            .spawn(move || {
                reaper.run();
            });
        if let Err(e) = spawned {
            warn!(pid = self.pid, "could not spawn teardown thread: {e}");
        }
        None
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate(false);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("console_mode", &self.console_mode())
            .field("running", &self.is_running())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

struct Reaper {
    pid: u32,
    pgid: Option<u32>,
    child: SharedChild,
    config: TeardownConfig,
}

impl Reaper {
    fn run(self) -> TeardownReport {
        let pid = self.pid;
        let mut report = TeardownReport {
            pid,
            graceful: false,
            escalated: false,
            tree_killed: 0,
            reaped: false,
            exit_code: None,
        };

        if let Some(code) = poll_exit(&self.child, self.config.grace(), self.config.poll_interval()) {
            report.graceful = true;
            report.reaped = true;
            report.exit_code = Some(code);
            debug!(pid, "process exited within grace window");
            return report;
        }

        warn!(pid, grace_ms = self.config.grace_ms, "process ignored SIGTERM, escalating");
        report.escalated = true;
        match process_tree::kill_tree(pid, self.config.tree_kill_passes) {
            Ok(killed) => report.tree_killed = killed.len(),
            Err(e) => {
                warn!(pid, "tree kill unavailable, signalling pid only: {e}");
                if let Err(e) = process_tree::signal_pid(pid, libc::SIGKILL) {
                    debug!(pid, "SIGKILL failed: {e}");
                }
            }
        }
        if let Err(e) = process_tree::signal_group_or_pid(pid, self.pgid, libc::SIGKILL) {
            debug!(pid, "group SIGKILL failed: {e}");
        }

        report.exit_code = poll_exit(&self.child, self.config.settle(), self.config.poll_interval());
        report.reaped = report.exit_code.is_some();
        if !report.reaped {
            warn!(pid, "process not reaped after SIGKILL settle window");
        }
        report
    }
}

/// Poll `try_wait` until the child exits or `window` elapses. Returns the
/// exit code if it was reaped.
fn poll_exit(child: &SharedChild, window: Duration, interval: Duration) -> Option<u32> {
    let deadline = Instant::now() + window;
    loop {
        match lock_child(child).try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => {}
            Err(e) => {
                debug!("try_wait failed: {e}");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(interval);
    }
}

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    lock(child, "child")
}

fn lock<'a, T: ?Sized>(m: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_input_appends_carriage_return() {
        assert_eq!(command_input("echo hi"), b"echo hi\r".to_vec());
    }

    #[test]
    fn command_input_normalizes_trailing_newlines() {
        assert_eq!(command_input("ls\n"), b"ls\r".to_vec());
        assert_eq!(command_input("ls\r\n"), b"ls\r".to_vec());
        assert_eq!(command_input(""), b"\r".to_vec());
    }

    #[test]
    fn command_input_keeps_interior_newlines() {
        assert_eq!(command_input("a\nb\n"), b"a\nb\r".to_vec());
    }
}
