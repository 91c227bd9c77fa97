//! Per-session history sizing: boost for resume workflows, shrink back to
//! baseline once the session has been idle long enough.
//!
//! The state here is pure bookkeeping. [`crate::manager::SessionManager`]
//! applies the returned sizes to the session's buffer and owns the timers.

use crate::dispatch::TimerHandle;

/// Whether `initial_command` starts a resume workflow that replays a long
/// transcript.
pub fn wants_boost(initial_command: &str) -> bool {
    initial_command.to_lowercase().contains("resume")
}

#[derive(Debug)]
pub struct ScrollbackState {
    current_lines: usize,
    pinned: bool,
    shrink_timer: Option<TimerHandle>,
}

/// Read-only view for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollbackSnapshot {
    pub current_lines: usize,
    pub pinned: bool,
    pub shrink_pending: bool,
}

impl ScrollbackState {
    pub fn new(current_lines: usize, pinned: bool) -> Self {
        Self {
            current_lines,
            pinned,
            shrink_timer: None,
        }
    }

    pub fn current_lines(&self) -> usize {
        self.current_lines
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Grow to at least `minimum_lines`, optionally pinning. Returns the new
    /// size when the buffer has to be resized.
    pub fn ensure(&mut self, minimum_lines: usize, pin: bool) -> Option<usize> {
        if pin {
            self.pinned = true;
            self.cancel_shrink();
        }
        if self.current_lines < minimum_lines {
            self.current_lines = minimum_lines;
            self.cancel_shrink();
            return Some(minimum_lines);
        }
        None
    }

    /// Whether arming a shrink timer makes sense right now.
    pub fn can_shrink(&self, baseline: usize) -> bool {
        !self.pinned && self.current_lines > baseline
    }

    /// Replace any outstanding shrink timer.
    pub fn arm_shrink(&mut self, timer: TimerHandle) {
        self.cancel_shrink();
        self.shrink_timer = Some(timer);
    }

    pub fn cancel_shrink(&mut self) {
        if let Some(timer) = self.shrink_timer.take() {
            timer.cancel();
        }
    }

    /// Called when the shrink timer fires. Returns the size to apply, or
    /// `None` if pinning or a resize since arming made the shrink moot.
    pub fn fire_shrink(&mut self, baseline: usize) -> Option<usize> {
        self.shrink_timer = None;
        if !self.can_shrink(baseline) {
            return None;
        }
        self.current_lines = baseline;
        Some(baseline)
    }

    pub fn snapshot(&self) -> ScrollbackSnapshot {
        ScrollbackSnapshot {
            current_lines: self.current_lines,
            pinned: self.pinned,
            shrink_pending: self
                .shrink_timer
                .as_ref()
                .is_some_and(|t| !t.is_cancelled()),
        }
    }
}

impl Drop for ScrollbackState {
    fn drop(&mut self) {
        self.cancel_shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SerialQueue;
    use std::time::Duration;

    fn timer(queue: &SerialQueue) -> TimerHandle {
        queue.dispatch_after(Duration::from_secs(3600), || {})
    }

    #[test]
    fn resume_detection_is_case_insensitive() {
        assert!(wants_boost("claude --Resume abc"));
        assert!(wants_boost("codex RESUME"));
        assert!(!wants_boost("claude"));
        assert!(!wants_boost(""));
    }

    #[test]
    fn ensure_grows_but_never_shrinks() {
        let mut state = ScrollbackState::new(1000, false);
        assert_eq!(state.ensure(5000, false), Some(5000));
        assert_eq!(state.ensure(2000, false), None);
        assert_eq!(state.current_lines(), 5000);
        assert!(!state.is_pinned());
    }

    #[test]
    fn pin_applies_without_size_change() {
        let mut state = ScrollbackState::new(5000, false);
        assert_eq!(state.ensure(10, true), None);
        assert!(state.is_pinned());
        assert!(!state.can_shrink(1000));
    }

    #[test]
    fn growing_cancels_pending_shrink() {
        let queue = SerialQueue::new("scrollback-test");
        let mut state = ScrollbackState::new(5000, false);
        let t = timer(&queue);
        state.arm_shrink(t.clone());
        assert!(state.snapshot().shrink_pending);
        state.ensure(9000, false);
        assert!(t.is_cancelled());
        assert!(!state.snapshot().shrink_pending);
    }

    #[test]
    fn rearming_cancels_previous_timer() {
        let queue = SerialQueue::new("scrollback-test");
        let mut state = ScrollbackState::new(5000, false);
        let first = timer(&queue);
        let second = timer(&queue);
        state.arm_shrink(first.clone());
        state.arm_shrink(second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn fire_shrinks_to_baseline_unless_pinned() {
        let mut state = ScrollbackState::new(120_000, false);
        assert_eq!(state.fire_shrink(10_000), Some(10_000));
        assert_eq!(state.current_lines(), 10_000);
        assert_eq!(state.fire_shrink(10_000), None);

        let mut pinned = ScrollbackState::new(120_000, true);
        assert_eq!(pinned.fire_shrink(10_000), None);
        assert_eq!(pinned.current_lines(), 120_000);
    }
}
