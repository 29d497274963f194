//! Lifecycle events emitted by the scheduler.
//!
//! In-process observers receive these through a Tokio broadcast channel
//! obtained from [`EventBus::subscribe`]. Slow observers that fall behind
//! the channel capacity miss events; they never block the scheduler.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::EndReason;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    LockAcquired {
        holder_id: String,
        requester_id: String,
    },
    LockReleased {
        holder_id: String,
        reason: EndReason,
    },
    QueueJoined {
        holder_id: String,
        position: usize,
    },
    QueueLeft {
        holder_id: String,
    },
    TimeoutWarning {
        holder_id: String,
        remaining_ms: u64,
    },
    Timeout {
        holder_id: String,
    },
}

impl SchedulerEvent {
    pub fn holder_id(&self) -> &str {
        match self {
            SchedulerEvent::LockAcquired { holder_id, .. }
            | SchedulerEvent::LockReleased { holder_id, .. }
            | SchedulerEvent::QueueJoined { holder_id, .. }
            | SchedulerEvent::QueueLeft { holder_id }
            | SchedulerEvent::TimeoutWarning { holder_id, .. }
            | SchedulerEvent::Timeout { holder_id } => holder_id,
        }
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::LockAcquired { .. } => "lock-acquired",
            SchedulerEvent::LockReleased { .. } => "lock-released",
            SchedulerEvent::QueueJoined { .. } => "queue-joined",
            SchedulerEvent::QueueLeft { .. } => "queue-left",
            SchedulerEvent::TimeoutWarning { .. } => "timeout-warning",
            SchedulerEvent::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub fn emit(&self, event: SchedulerEvent) {
        trace!(event = event.name(), holder = %event.holder_id(), "scheduler event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_names() {
        let event = SchedulerEvent::TimeoutWarning {
            holder_id: "conv-1".into(),
            remaining_ms: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timeout-warning");
        assert_eq!(json["holder_id"], "conv-1");
        assert_eq!(event.name(), "timeout-warning");

        let released = SchedulerEvent::LockReleased {
            holder_id: "conv-1".into(),
            reason: EndReason::Completed,
        };
        let json = serde_json::to_value(&released).unwrap();
        assert_eq!(json["type"], "lock-released");
        assert_eq!(json["reason"], "completed");
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SchedulerEvent::QueueJoined {
            holder_id: "conv-2".into(),
            position: 1,
        });
        bus.emit(SchedulerEvent::QueueLeft {
            holder_id: "conv-2".into(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "queue-joined");
        assert_eq!(rx.recv().await.unwrap().name(), "queue-left");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SchedulerEvent::Timeout {
            holder_id: "conv-1".into(),
        });
    }
}
