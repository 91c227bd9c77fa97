use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

/// Change to the set of live sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Created { key: String, pid: u32 },
    Evicted { key: String, pid: u32 },
    Stopped { key: String, pid: u32 },
    Exited { key: String, pid: u32, exit_code: Option<u32> },
    Rekeyed { from: String, to: String, pid: u32 },
}

impl SessionEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Created { key, .. }
            | Self::Evicted { key, .. }
            | Self::Stopped { key, .. }
            | Self::Exited { key, .. } => key,
            Self::Rekeyed { to, .. } => to,
        }
    }
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a receiver that gets
/// every event published after the subscription was created.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<SessionEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all current subscribers. Subscribers whose receivers have
    /// been dropped are pruned.
    pub fn publish(&self, event: SessionEvent) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<SessionEvent>>> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("EventBus lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(key: &str) -> SessionEvent {
        SessionEvent::Created {
            key: key.into(),
            pid: 1,
        }
    }

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(created("pane-1"));
        assert_eq!(a.try_recv().unwrap(), created("pane-1"));
        assert_eq!(b.try_recv().unwrap(), created("pane-1"));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(created("x"));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn rekeyed_reports_new_key() {
        let ev = SessionEvent::Rekeyed {
            from: "tmp".into(),
            to: "final".into(),
            pid: 9,
        };
        assert_eq!(ev.key(), "final");
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(created("pane-1")).unwrap();
        assert_eq!(json["type"], "created");
        assert_eq!(json["key"], "pane-1");
    }
}
