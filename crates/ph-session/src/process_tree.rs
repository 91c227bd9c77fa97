//! Process-table snapshots, subtree kills and the signal helpers used by
//! session teardown.
//!
//! A snapshot is only consistent with itself: pids may exit or be reused
//! between two snapshots, so every traversal works on a single one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use tracing::{debug, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Other,
}

impl ProcessState {
    /// Map the first character of a `ps` STAT column or `/proc/<pid>/stat`
    /// state field.
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' | 'D' | 'I' | 'U' => Self::Sleeping,
            'T' | 't' => Self::Stopped,
            'Z' | 'X' | 'x' => Self::Zombie,
            _ => Self::Other,
        }
    }

    /// Whether a process in this state counts as doing work for the user.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped | Self::Zombie)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub state: ProcessState,
}

/// One point-in-time copy of the OS process table.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
}

impl ProcessTable {
    pub fn from_entries(entries: Vec<ProcessEntry>) -> Self {
        Self { entries }
    }

    /// Read the live process table.
    #[cfg(target_os = "linux")]
    pub fn snapshot() -> Result<Self> {
        let dir = std::fs::read_dir("/proc")
            .map_err(|e| SessionError::ProcessTable(format!("read /proc: {e}")))?;
        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // The process may exit between readdir and read; skip it.
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(parsed) = parse_proc_stat(pid, &stat) {
                entries.push(parsed);
            }
        }
        Ok(Self { entries })
    }

    /// Read the live process table.
    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn snapshot() -> Result<Self> {
        let output = std::process::Command::new("ps")
            .args(["-axo", "pid=,ppid=,stat="])
            .output()
            .map_err(|e| SessionError::ProcessTable(format!("ps: {e}")))?;
        if !output.status.success() {
            return Err(SessionError::ProcessTable(format!(
                "ps exited with {}",
                output.status
            )));
        }
        Ok(Self::parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Parse `ps -axo pid=,ppid=,stat=` output; malformed lines are skipped.
    pub fn parse_ps(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let state = parts.next()?.chars().next()?;
                Some(ProcessEntry {
                    pid,
                    ppid,
                    state: ProcessState::from_code(state),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ProcessEntry] {
        &self.entries
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessEntry> {
        self.entries.iter().find(|e| e.pid == pid)
    }

    pub fn children_map(&self) -> HashMap<u32, Vec<u32>> {
        let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
        for e in &self.entries {
            map.entry(e.ppid).or_default().push(e.pid);
        }
        map
    }

    /// Breadth-first order of `root` and everything below it. Each pid
    /// appears once even if the snapshot contains a parent cycle.
    pub fn subtree(&self, root: u32) -> Vec<u32> {
        let children = self.children_map();
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut frontier = VecDeque::from([root]);
        while let Some(pid) = frontier.pop_front() {
            if !visited.insert(pid) {
                continue;
            }
            order.push(pid);
            if let Some(kids) = children.get(&pid) {
                frontier.extend(kids.iter().copied().filter(|k| !visited.contains(k)));
            }
        }
        order
    }

    /// Whether `root` has a direct child that is neither a zombie nor stopped.
    pub fn has_active_children(&self, root: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.ppid == root && e.pid != root && e.state.is_active())
    }
}

#[cfg(target_os = "linux")]
fn parse_proc_stat(pid: u32, stat: &str) -> Option<ProcessEntry> {
    // "pid (comm) S ppid ..." where comm may itself contain parentheses.
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some(ProcessEntry {
        pid,
        ppid,
        state: ProcessState::from_code(state),
    })
}

// ---------------------------------------------------------------------------
// Tree kill
// ---------------------------------------------------------------------------

/// Signal every pid in `root`'s subtree exactly once, using one snapshot per
/// pass. Later passes re-snapshot and only signal pids not yet visited,
/// stopping early once a pass finds nothing new.
///
/// Returns the pids that were signalled. Fails only if the very first
/// snapshot cannot be taken; the caller then signals `root` on its own.
pub fn kill_tree(root: u32, passes: u8) -> Result<Vec<u32>> {
    let first = ProcessTable::snapshot()?;
    let mut visited = HashSet::new();
    let mut killed = kill_tree_in(&first, root, &mut visited, |pid| {
        signal_pid(pid, libc::SIGKILL)
    });

    for pass in 1..passes.max(1) {
        let table = match ProcessTable::snapshot() {
            Ok(t) => t,
            Err(e) => {
                warn!(root, pass, "process table re-read failed: {e}");
                break;
            }
        };
        let more = kill_tree_in(&table, root, &mut visited, |pid| {
            signal_pid(pid, libc::SIGKILL)
        });
        if more.is_empty() {
            break;
        }
        killed.extend(more);
    }

    debug!(root, count = killed.len(), "process tree killed");
    Ok(killed)
}

/// Walk `table` from `root`, calling `signal` for each pid not yet in
/// `visited`. Signal failures (usually the process already exited) are
/// logged and otherwise ignored.
pub fn kill_tree_in<F>(
    table: &ProcessTable,
    root: u32,
    visited: &mut HashSet<u32>,
    mut signal: F,
) -> Vec<u32>
where
    F: FnMut(u32) -> io::Result<()>,
{
    let mut signalled = Vec::new();
    for pid in table.subtree(root) {
        if !visited.insert(pid) {
            continue;
        }
        if let Err(e) = signal(pid) {
            debug!(pid, "kill failed: {e}");
        }
        signalled.push(pid);
    }
    signalled
}

// ---------------------------------------------------------------------------
// Signal helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Process group of `pid`, if it can still be looked up.
#[cfg(unix)]
pub fn process_group_of(pid: u32) -> Option<u32> {
    // SAFETY: getpgid(2) has no memory-safety preconditions.
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    (pgid > 0).then_some(pgid as u32)
}

/// Signal the process group `pgid` when known, otherwise `pid` alone.
#[cfg(unix)]
pub fn signal_group_or_pid(pid: u32, pgid: Option<u32>, signal: libc::c_int) -> io::Result<()> {
    if let Some(pgid) = pgid {
        // SAFETY: killpg(2) has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid as libc::pid_t, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        debug!(pid, pgid, "killpg failed, signalling pid: {err}");
    }
    signal_pid(pid, signal)
}

/// Whether a process with `pid` exists (zombies included).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 checks existence without sending a signal.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, ppid: u32, state: ProcessState) -> ProcessEntry {
        ProcessEntry { pid, ppid, state }
    }

    fn sample() -> ProcessTable {
        use ProcessState::*;
        ProcessTable::from_entries(vec![
            entry(1, 0, Sleeping),
            entry(100, 1, Sleeping),
            entry(101, 100, Running),
            entry(102, 100, Sleeping),
            entry(103, 101, Sleeping),
            entry(200, 1, Sleeping),
        ])
    }

    #[test]
    fn parse_ps_output() {
        let table = ProcessTable::parse_ps(
            "    1     0 Ss\n  100     1 S+\n  101   100 Z\ngarbage line\n  102   100 T\n",
        );
        assert_eq!(table.entries().len(), 4);
        assert_eq!(table.get(101).unwrap().state, ProcessState::Zombie);
        assert_eq!(table.get(102).unwrap().state, ProcessState::Stopped);
        assert_eq!(table.get(100).unwrap().ppid, 1);
    }

    #[test]
    fn subtree_is_breadth_first() {
        assert_eq!(sample().subtree(100), vec![100, 101, 102, 103]);
        assert_eq!(sample().subtree(200), vec![200]);
    }

    #[test]
    fn subtree_survives_parent_cycle() {
        use ProcessState::*;
        let table = ProcessTable::from_entries(vec![
            entry(10, 11, Sleeping),
            entry(11, 10, Sleeping),
        ]);
        assert_eq!(table.subtree(10), vec![10, 11]);
    }

    #[test]
    fn kill_signals_each_pid_once() {
        let table = sample();
        let mut visited = HashSet::new();
        let mut calls = Vec::new();
        let killed = kill_tree_in(&table, 100, &mut visited, |pid| {
            calls.push(pid);
            Ok(())
        });
        assert_eq!(killed, vec![100, 101, 102, 103]);
        assert_eq!(calls, killed);

        let again = kill_tree_in(&table, 100, &mut visited, |_| Ok(()));
        assert!(again.is_empty(), "visited pids must not be signalled twice");
    }

    #[test]
    fn kill_continues_past_signal_errors() {
        let table = sample();
        let mut visited = HashSet::new();
        let killed = kill_tree_in(&table, 100, &mut visited, |pid| {
            if pid == 101 {
                Err(io::Error::from_raw_os_error(libc::ESRCH))
            } else {
                Ok(())
            }
        });
        assert_eq!(killed.len(), 4);
    }

    #[test]
    fn active_children_ignore_zombies_and_stopped() {
        use ProcessState::*;
        let idle = ProcessTable::from_entries(vec![
            entry(50, 1, Sleeping),
            entry(51, 50, Zombie),
            entry(52, 50, Stopped),
        ]);
        assert!(!idle.has_active_children(50));

        let busy = ProcessTable::from_entries(vec![entry(50, 1, Sleeping), entry(53, 50, Sleeping)]);
        assert!(busy.has_active_children(50));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_stat_with_parens_in_comm() {
        let parsed = parse_proc_stat(42, "42 (weird) name)) S 7 42 42 0 -1").unwrap();
        assert_eq!(parsed.ppid, 7);
        assert_eq!(parsed.state, ProcessState::Sleeping);
    }

    #[test]
    fn live_snapshot_contains_current_process() {
        let table = ProcessTable::snapshot().expect("snapshot");
        assert!(table.get(std::process::id()).is_some());
    }

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn kill_tree_terminates_children() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .expect("spawn sh");
        let root = child.id();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let killed = kill_tree(root, 2).expect("kill tree");
        assert!(killed.contains(&root));
        assert!(killed.len() >= 3, "expected root and two sleeps, got {killed:?}");
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}
