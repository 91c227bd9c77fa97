//! The session registry.
//!
//! Maps caller-chosen keys to live PTY sessions, keeps at most
//! `max_live_sessions` of them by evicting the least recently used, and owns
//! all per-key bookkeeping (timestamps, scrollback state, bootstrap markers,
//! the active key). Every mutation happens under one registry lock; output
//! delivery and timers run on the manager's serial queue.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use ph_core::config::Config;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{BootstrapDir, ShellEnvironment};
use crate::buffer::{BufferFactory, HistoryBufferFactory, TerminalBuffer};
use crate::dispatch::SerialQueue;
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::process_tree::ProcessTable;
use crate::scrollback::{self, ScrollbackSnapshot, ScrollbackState};
use crate::session::{LaunchSpec, Session, TeardownReport, Termination};

const SHELL_FALLBACKS: &[&str] = &["/bin/bash", "/bin/sh"];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Launch a specific program directly instead of an interactive login shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlaid on the base shell environment; later entries win.
    pub env: Vec<(String, String)>,
}

impl ConsoleSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Row returned by [`SessionManager::get_active_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub key: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub console_mode: bool,
}

/// Handle to a resolved session. Holding one does not keep the session in
/// the registry; once stopped or evicted the handle's operations are no-ops.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn pid(&self) -> u32 {
        self.session.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.session.started_at()
    }

    pub fn console_mode(&self) -> bool {
        self.session.console_mode()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn send(&self, text: &str) {
        self.session.send_text(text);
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        self.session.send(bytes);
    }

    pub fn execute(&self, command: &str) {
        self.session.execute(command);
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.session.resize(cols, rows);
    }

    pub fn buffer(&self) -> Arc<dyn TerminalBuffer> {
        Arc::clone(self.session.buffer())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionHandle").field(&self.session).finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    last_used: HashMap<String, u64>,
    clock: u64,
    scrollback: HashMap<String, ScrollbackState>,
    bootstrapped: HashSet<String>,
    active: Option<String>,
}

impl Registry {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.last_used.insert(key.to_string(), self.clock);
    }

    /// Drop every piece of bookkeeping for `key`.
    fn remove(&mut self, key: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(key);
        self.last_used.remove(key);
        self.scrollback.remove(key);
        self.bootstrapped.remove(key);
        if self.active.as_deref() == Some(key) {
            self.active = None;
        }
        session
    }

    fn key_of(&self, session_id: Uuid) -> Option<String> {
        self.sessions
            .iter()
            .find(|(_, s)| s.id() == session_id)
            .map(|(k, _)| k.clone())
    }

    /// Keys beyond the `keep` most recently used, oldest last.
    fn lru_victims(&self, keep: usize, exempt: Option<&str>) -> Vec<String> {
        let mut keys: Vec<(&String, u64)> = self
            .sessions
            .keys()
            .map(|k| (k, self.last_used.get(k).copied().unwrap_or(0)))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        keys.into_iter()
            .skip(keep)
            .map(|(k, _)| k.clone())
            .filter(|k| Some(k.as_str()) != exempt)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

struct ManagerInner {
    config: Config,
    queue: SerialQueue,
    events: EventBus,
    buffers: Arc<dyn BufferFactory>,
    shell_env: ShellEnvironment,
    bootstrap: BootstrapDir,
    registry: Mutex<Registry>,
}

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Manager with in-memory [`HistoryBuffer`](crate::buffer::HistoryBuffer)s
    /// and the default bootstrap location.
    pub fn new(config: Config) -> Self {
        Self::with_buffer_factory(config, Arc::new(HistoryBufferFactory))
    }

    pub fn with_buffer_factory(config: Config, buffers: Arc<dyn BufferFactory>) -> Self {
        Self::with_parts(
            config,
            buffers,
            ShellEnvironment::detect(),
            BootstrapDir::default_location(),
        )
    }

    pub fn with_parts(
        config: Config,
        buffers: Arc<dyn BufferFactory>,
        shell_env: ShellEnvironment,
        bootstrap: BootstrapDir,
    ) -> Self {
        info!(
            max_live_sessions = config.sessions.max_live_sessions,
            shell = %config.sessions.shell,
            "creating SessionManager"
        );
        Self {
            inner: Arc::new(ManagerInner {
                config,
                queue: SerialQueue::new("ph-delivery"),
                events: EventBus::new(),
                buffers,
                shell_env,
                bootstrap,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to changes of the live-session set.
    pub fn subscribe(&self) -> flume::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Block until all output queued so far has been fed to its buffer.
    pub fn wait_for_delivery(&self) {
        self.inner.queue.barrier();
    }

    // -- lifecycle ----------------------------------------------------------

    /// Return the live session for `key`, spawning one if there is none.
    ///
    /// An existing live session is returned as-is (no restart) with its
    /// last-used time refreshed and its console-mode flag updated. Only a
    /// spawn failure is reported as an error, and then nothing is registered.
    ///
    /// The registry lock is not held while the process is spawned; if another
    /// caller registers a live session for `key` meanwhile, that one wins and
    /// the spare process is torn down.
    pub fn resolve(
        &self,
        key: &str,
        initial_command: &str,
        console: Option<ConsoleSpec>,
    ) -> Result<SessionHandle> {
        let inner = &self.inner;
        let console_mode = console.is_some();
        if let Some(existing) = inner.refresh_live(key, console_mode) {
            return Ok(existing);
        }

        let boost = scrollback::wants_boost(initial_command);
        let sb = &inner.config.scrollback;
        let lines = if boost { sb.boosted_lines } else { sb.baseline_lines };
        let launch = inner.launch_spec(console.as_ref());
        let buffer = inner.buffers.create(key, lines);

        let session = match Session::spawn(
            &launch,
            buffer,
            inner.queue.clone(),
            &inner.config,
            console_mode,
        ) {
            Ok(s) => s,
            Err(e) => {
                error!(key, program = %launch.program, "session spawn failed: {e}");
                return Err(e);
            }
        };
        let pid = session.pid();

        let mut reg = inner.registry();
        if let Some(existing) = reg.sessions.get(key).cloned().filter(|s| s.is_running()) {
            reg.touch(key);
            existing.set_console_mode(console_mode);
            drop(reg);
            debug!(key, pid, "key resolved concurrently, discarding spare session");
            session.terminate(false);
            return Ok(SessionHandle::new(existing));
        }
        let discarded = reg.remove(key);
        if let Some(old) = &discarded {
            debug!(key, pid = old.pid(), "discarding dead session");
        }

        reg.sessions.insert(key.to_string(), Arc::clone(&session));
        reg.touch(key);
        reg.scrollback
            .insert(key.to_string(), ScrollbackState::new(lines, boost));
        inner.watch_exit(&session);
        if !console_mode && !initial_command.trim().is_empty() {
            inner.schedule_initial_command(&session, initial_command);
        }

        let max = inner.config.sessions.max_live_sessions;
        let evicted: Vec<(String, Arc<Session>)> = reg
            .lru_victims(max, Some(key))
            .into_iter()
            .filter_map(|k| reg.remove(&k).map(|s| (k, s)))
            .collect();
        drop(reg);

        info!(key, pid, console_mode, boosted = boost, "session created");
        inner.events.publish(SessionEvent::Created {
            key: key.to_string(),
            pid,
        });
        inner.evict(evicted);
        if let Some(old) = discarded {
            old.terminate(false);
        }
        Ok(SessionHandle::new(session))
    }

    /// Remove `key` and shut its process down.
    ///
    /// With `synchronous` the grace wait, escalation and reaping happen on the
    /// calling thread and the report is returned; otherwise they run in the
    /// background and `None` is returned.
    pub fn stop(&self, key: &str, synchronous: bool) -> Option<TeardownReport> {
        let session = self.inner.registry().remove(key)?;
        let pid = session.pid();
        info!(key, pid, synchronous, "stopping session");
        self.inner.events.publish(SessionEvent::Stopped {
            key: key.to_string(),
            pid,
        });
        session.terminate(synchronous)
    }

    /// Stop every session whose key starts with `prefix`. Synchronous
    /// teardowns run concurrently and all complete before returning.
    pub fn stop_all(&self, prefix: &str, synchronous: bool) -> Vec<TeardownReport> {
        let keys: Vec<String> = {
            let reg = self.inner.registry();
            reg.sessions
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        };
        if !synchronous {
            for key in &keys {
                self.stop(key, false);
            }
            return Vec::new();
        }
        std::thread::scope(|scope| {
            let workers: Vec<_> = keys
                .iter()
                .map(|key| scope.spawn(move || self.stop(key, true)))
                .collect();
            workers
                .into_iter()
                .filter_map(|w| w.join().ok().flatten())
                .collect()
        })
    }

    /// Move a live session from `old_key` to `new_key` without touching its
    /// process. A live session already under `new_key` is stopped first.
    /// Returns `false` (and does nothing) if `old_key` has no live session.
    pub fn rekey(&self, old_key: &str, new_key: &str) -> bool {
        let inner = &self.inner;
        let mut reg = inner.registry();
        let Some(session) = reg.sessions.get(old_key).cloned() else {
            return false;
        };
        if !session.is_running() {
            return false;
        }
        if old_key == new_key {
            return true;
        }

        let displaced = reg.remove(new_key);
        let was_active = reg.active.as_deref() == Some(old_key);

        reg.sessions.remove(old_key);
        let stamp = reg.last_used.remove(old_key);
        let scrollback = reg.scrollback.remove(old_key);
        let bootstrapped = reg.bootstrapped.remove(old_key);

        reg.sessions.insert(new_key.to_string(), Arc::clone(&session));
        match stamp {
            Some(stamp) => {
                reg.last_used.insert(new_key.to_string(), stamp);
            }
            None => reg.touch(new_key),
        }
        if let Some(state) = scrollback {
            reg.scrollback.insert(new_key.to_string(), state);
        }
        if bootstrapped {
            reg.bootstrapped.insert(new_key.to_string());
        }
        if was_active {
            reg.active = Some(new_key.to_string());
        }
        drop(reg);

        if let Some(old) = displaced {
            info!(key = new_key, pid = old.pid(), "rekey displaced existing session");
            inner.events.publish(SessionEvent::Stopped {
                key: new_key.to_string(),
                pid: old.pid(),
            });
            old.terminate(false);
        }
        info!(from = old_key, to = new_key, pid = session.pid(), "session rekeyed");
        inner.events.publish(SessionEvent::Rekeyed {
            from: old_key.to_string(),
            to: new_key.to_string(),
            pid: session.pid(),
        });
        true
    }

    /// Stop every session beyond the `keep` most recently used. Returns the
    /// evicted keys.
    pub fn prune_lru(&self, keep: usize) -> Vec<String> {
        let evicted: Vec<(String, Arc<Session>)> = {
            let mut reg = self.inner.registry();
            reg.lru_victims(keep, None)
                .into_iter()
                .filter_map(|k| reg.remove(&k).map(|s| (k, s)))
                .collect()
        };
        let keys = evicted.iter().map(|(k, _)| k.clone()).collect();
        self.inner.evict(evicted);
        keys
    }

    // -- input --------------------------------------------------------------

    pub fn send(&self, key: &str, text: &str) {
        match self.lookup(key) {
            Some(s) => s.send_text(text),
            None => debug!(key, "send to unknown session ignored"),
        }
    }

    /// Send `command` followed by a carriage return.
    pub fn execute(&self, key: &str, command: &str) {
        match self.lookup(key) {
            Some(s) => s.execute(command),
            None => debug!(key, "execute on unknown session ignored"),
        }
    }

    pub fn resize(&self, key: &str, cols: u16, rows: u16) {
        if let Some(s) = self.lookup(key) {
            s.resize(cols, rows);
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn session(&self, key: &str) -> Option<SessionHandle> {
        self.lookup(key).map(SessionHandle::new)
    }

    /// Whether `key`'s process has a runnable child, i.e. something is
    /// running in the foreground of the shell. An idle shell reports false.
    pub fn has_running_process(&self, key: &str) -> bool {
        let Some(session) = self.lookup(key).filter(|s| s.is_running()) else {
            return false;
        };
        match ProcessTable::snapshot() {
            Ok(table) => table.has_active_children(session.pid()),
            Err(e) => {
                warn!(key, "process table unavailable: {e}");
                false
            }
        }
    }

    pub fn has_any_running_processes(&self) -> bool {
        let pids: Vec<u32> = {
            let reg = self.inner.registry();
            reg.sessions
                .values()
                .filter(|s| s.is_running())
                .map(|s| s.pid())
                .collect()
        };
        if pids.is_empty() {
            return false;
        }
        match ProcessTable::snapshot() {
            Ok(table) => pids.iter().any(|pid| table.has_active_children(*pid)),
            Err(e) => {
                warn!("process table unavailable: {e}");
                false
            }
        }
    }

    /// Live sessions, most recently used first.
    pub fn get_active_sessions(&self) -> Vec<SessionSummary> {
        let reg = self.inner.registry();
        let mut rows: Vec<(u64, SessionSummary)> = reg
            .sessions
            .iter()
            .filter(|(_, s)| s.is_running())
            .map(|(k, s)| {
                (
                    reg.last_used.get(k).copied().unwrap_or(0),
                    SessionSummary {
                        key: k.clone(),
                        pid: s.pid(),
                        started_at: s.started_at(),
                        console_mode: s.console_mode(),
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Number of registered sessions, including ones whose process died.
    pub fn live_count(&self) -> usize {
        self.inner.registry().sessions.len()
    }

    pub fn has_bootstrapped(&self, key: &str) -> bool {
        self.inner.registry().bootstrapped.contains(key)
    }

    // -- focus / recency ----------------------------------------------------

    /// Refresh `key`'s last-used time. Returns false for unknown keys.
    pub fn touch(&self, key: &str) -> bool {
        let mut reg = self.inner.registry();
        if !reg.sessions.contains_key(key) {
            return false;
        }
        reg.touch(key);
        true
    }

    /// Mark `key` as the focused session. Returns false for unknown keys.
    pub fn set_active(&self, key: &str) -> bool {
        let mut reg = self.inner.registry();
        if !reg.sessions.contains_key(key) {
            return false;
        }
        reg.touch(key);
        reg.active = Some(key.to_string());
        true
    }

    pub fn clear_active(&self) {
        self.inner.registry().active = None;
    }

    pub fn active_key(&self) -> Option<String> {
        self.inner.registry().active.clone()
    }

    // -- scrollback ---------------------------------------------------------

    /// Grow `key`'s history to at least `minimum_lines` and optionally pin it
    /// so it is never shrunk automatically.
    pub fn ensure_scrollback(&self, key: &str, minimum_lines: usize, pin: bool) {
        let mut reg = self.inner.registry();
        let Some(session) = reg.sessions.get(key).cloned() else {
            return;
        };
        let Some(state) = reg.scrollback.get_mut(key) else {
            return;
        };
        if let Some(lines) = state.ensure(minimum_lines, pin) {
            debug!(key, lines, pinned = state.is_pinned(), "scrollback boosted");
            session.resize_history(lines);
        }
    }

    /// (Re)arm the idle timer that shrinks `key`'s history back to baseline.
    /// Each call restarts the delay.
    pub fn schedule_shrink(&self, key: &str) {
        let inner = &self.inner;
        let baseline = inner.config.scrollback.baseline_lines;
        let mut reg = inner.registry();
        let Some(session_id) = reg.sessions.get(key).map(|s| s.id()) else {
            return;
        };
        let Some(state) = reg.scrollback.get_mut(key) else {
            return;
        };
        if !state.can_shrink(baseline) {
            state.cancel_shrink();
            return;
        }
        let weak: Weak<ManagerInner> = Arc::downgrade(inner);
        let timer = inner
            .queue
            .dispatch_after(inner.config.scrollback.shrink_delay(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire_shrink(session_id);
                }
            });
        state.arm_shrink(timer);
    }

    pub fn scrollback(&self, key: &str) -> Option<ScrollbackSnapshot> {
        self.inner
            .registry()
            .scrollback
            .get(key)
            .map(ScrollbackState::snapshot)
    }

    fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        self.inner.registry().sessions.get(key).cloned()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.inner.registry();
        f.debug_struct("SessionManager")
            .field("sessions", &reg.sessions.len())
            .field("active", &reg.active)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ManagerInner
// ---------------------------------------------------------------------------

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| {
            warn!("session registry lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// The live session for `key` with its recency and console flag
    /// refreshed, if there is one.
    fn refresh_live(&self, key: &str, console_mode: bool) -> Option<SessionHandle> {
        let mut reg = self.registry();
        let existing = reg.sessions.get(key).cloned().filter(|s| s.is_running())?;
        reg.touch(key);
        existing.set_console_mode(console_mode);
        Some(SessionHandle::new(existing))
    }

    fn launch_spec(&self, console: Option<&ConsoleSpec>) -> LaunchSpec {
        let cfg = &self.config.sessions;
        let mut env = self.shell_env.vars();
        merge_env(&mut env, [("TERM".to_string(), cfg.term.clone())]);

        match console {
            Some(spec) => {
                merge_env(&mut env, spec.env.iter().cloned());
                LaunchSpec {
                    program: spec.program.clone(),
                    args: spec.args.clone(),
                    cwd: spec.cwd.clone(),
                    env,
                    cols: cfg.default_cols,
                    rows: cfg.default_rows,
                }
            }
            None => {
                match self.bootstrap.resolve(&self.shell_env) {
                    Ok(dir) => merge_env(
                        &mut env,
                        [("ZDOTDIR".to_string(), dir.display().to_string())],
                    ),
                    Err(e) => warn!("shell bootstrap unavailable, launching without it: {e}"),
                }
                LaunchSpec {
                    program: pick_shell(&cfg.shell),
                    args: cfg.shell_args.clone(),
                    cwd: None,
                    env,
                    cols: cfg.default_cols,
                    rows: cfg.default_rows,
                }
            }
        }
    }

    /// Subscribe once to the session's exit signal and re-publish it as a
    /// change event.
    fn watch_exit(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(rx) = session.take_termination() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name(format!("ph-exit-{}", session.pid()))
            .spawn(move || {
                if let Ok(term) = rx.recv() {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_exit(term);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(pid = session.pid(), "could not watch session exit: {e}");
        }
    }

    fn handle_exit(&self, term: Termination) {
        let key = self.registry().key_of(term.session_id);
        match key {
            Some(key) => {
                info!(key = %key, pid = term.pid, exit_code = ?term.exit_code, "session process exited");
                self.events.publish(SessionEvent::Exited {
                    key,
                    pid: term.pid,
                    exit_code: term.exit_code,
                });
            }
            None => debug!(pid = term.pid, "exit of an unregistered session"),
        }
    }

    fn schedule_initial_command(self: &Arc<Self>, session: &Arc<Session>, command: &str) {
        let weak = Arc::downgrade(self);
        let session_id = session.id();
        let command = command.to_string();
        self.queue
            .dispatch_after(self.config.sessions.initial_command_delay(), move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut reg = inner.registry();
                let Some(key) = reg.key_of(session_id) else {
                    return;
                };
                let Some(session) = reg.sessions.get(&key).cloned() else {
                    return;
                };
                if session.is_running() {
                    session.execute(&command);
                    debug!(key = %key, "initial command injected");
                    reg.bootstrapped.insert(key);
                }
            });
    }

    fn fire_shrink(&self, session_id: Uuid) {
        let baseline = self.config.scrollback.baseline_lines;
        let mut reg = self.registry();
        let Some(key) = reg.key_of(session_id) else {
            return;
        };
        let Some(session) = reg.sessions.get(&key).cloned() else {
            return;
        };
        if let Some(lines) = reg.scrollback.get_mut(&key).and_then(|s| s.fire_shrink(baseline)) {
            debug!(key = %key, lines, "scrollback shrunk to baseline");
            session.resize_history(lines);
        }
    }

    fn evict(&self, evicted: Vec<(String, Arc<Session>)>) {
        for (key, session) in evicted {
            info!(key = %key, pid = session.pid(), "evicting least recently used session");
            self.events.publish(SessionEvent::Evicted {
                key,
                pid: session.pid(),
            });
            session.terminate(false);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let reg = self.registry.get_mut().unwrap_or_else(|e| e.into_inner());
        for (key, session) in reg.sessions.drain() {
            debug!(key = %key, pid = session.pid(), "manager dropped, tearing down session");
            session.terminate(false);
        }
    }
}

/// Set each `(key, value)` in `env`, replacing an existing entry.
fn merge_env(env: &mut Vec<(String, String)>, overlay: impl IntoIterator<Item = (String, String)>) {
    for (key, value) in overlay {
        env.retain(|(k, _)| *k != key);
        env.push((key, value));
    }
}

fn pick_shell(configured: &str) -> String {
    if Path::new(configured).exists() {
        return configured.to_string();
    }
    match SHELL_FALLBACKS.iter().find(|p| Path::new(p).exists()) {
        Some(fallback) => {
            debug!(configured, fallback, "configured shell missing, using fallback");
            fallback.to_string()
        }
        None => configured.to_string(),
    }
}
