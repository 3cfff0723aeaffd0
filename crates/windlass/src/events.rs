//! In-process event channels.
//!
//! Emission is best-effort: a send never blocks the pipeline, and a slow
//! subscriber lags and drops old events per broadcast-channel semantics.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Default per-channel buffer.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Named event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    JobAdded,
    JobActive,
    JobCompleted,
    JobFailed,
    JobProgress,
    JobStalled,
    JobDelayed,
    JobRemoved,
    Ready,
    Error,
    BatchAdded,
    BatchCompleted,
    BatchFailed,
    BatchProgress,
    GroupCreated,
    GroupRemoved,
    ObservableStarted,
    ObservableStopped,
    JobMovedToDeadLetter,
    JobRepublishedFromDeadLetter,
}

/// Event payloads published on the channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEvent {
    JobAdded {
        queue: String,
        job_id: String,
    },
    JobActive {
        queue: String,
        job_id: String,
    },
    JobCompleted {
        queue: String,
        job_id: String,
        return_value: Option<serde_json::Value>,
    },
    JobFailed {
        queue: String,
        job_id: String,
        reason: String,
    },
    JobProgress {
        queue: String,
        job_id: String,
        progress: u8,
    },
    JobStalled {
        queue: String,
        job_id: String,
    },
    JobDelayed {
        queue: String,
        job_id: String,
        fire_at: i64,
    },
    JobRemoved {
        queue: String,
        job_id: String,
    },
    Ready {
        queue: String,
    },
    Error {
        queue: String,
        message: String,
    },
    BatchAdded {
        batch_id: String,
        jobs: usize,
    },
    BatchCompleted {
        batch_id: String,
    },
    BatchFailed {
        batch_id: String,
        error: String,
    },
    BatchProgress {
        batch_id: String,
        progress: u8,
    },
    GroupCreated {
        group: String,
        queue: String,
    },
    GroupRemoved {
        group: String,
        queue: String,
    },
    ObservableStarted {
        observable_id: String,
    },
    ObservableStopped {
        observable_id: String,
    },
    JobMovedToDeadLetter {
        queue: String,
        job_id: String,
        reason: String,
    },
    JobRepublishedFromDeadLetter {
        queue: String,
        job_id: String,
    },
}

impl QueueEvent {
    /// The channel this event is published on.
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::JobAdded { .. } => EventKind::JobAdded,
            QueueEvent::JobActive { .. } => EventKind::JobActive,
            QueueEvent::JobCompleted { .. } => EventKind::JobCompleted,
            QueueEvent::JobFailed { .. } => EventKind::JobFailed,
            QueueEvent::JobProgress { .. } => EventKind::JobProgress,
            QueueEvent::JobStalled { .. } => EventKind::JobStalled,
            QueueEvent::JobDelayed { .. } => EventKind::JobDelayed,
            QueueEvent::JobRemoved { .. } => EventKind::JobRemoved,
            QueueEvent::Ready { .. } => EventKind::Ready,
            QueueEvent::Error { .. } => EventKind::Error,
            QueueEvent::BatchAdded { .. } => EventKind::BatchAdded,
            QueueEvent::BatchCompleted { .. } => EventKind::BatchCompleted,
            QueueEvent::BatchFailed { .. } => EventKind::BatchFailed,
            QueueEvent::BatchProgress { .. } => EventKind::BatchProgress,
            QueueEvent::GroupCreated { .. } => EventKind::GroupCreated,
            QueueEvent::GroupRemoved { .. } => EventKind::GroupRemoved,
            QueueEvent::ObservableStarted { .. } => EventKind::ObservableStarted,
            QueueEvent::ObservableStopped { .. } => EventKind::ObservableStopped,
            QueueEvent::JobMovedToDeadLetter { .. } => EventKind::JobMovedToDeadLetter,
            QueueEvent::JobRepublishedFromDeadLetter { .. } => {
                EventKind::JobRepublishedFromDeadLetter
            }
        }
    }
}

/// Topic-indexed event fan-out. Each subscription is an independent bounded
/// channel; ordering is guaranteed within a topic, not across topics.
pub struct EventBus {
    channels: RwLock<HashMap<EventKind, broadcast::Sender<QueueEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus with the default per-channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a bus with an explicit per-channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to one channel.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<QueueEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes an event. Returns how many subscribers the channel had; a
    /// channel with no subscribers drops the event silently.
    pub fn emit(&self, event: QueueEvent) -> usize {
        let kind = event.kind();
        let channels = self.channels.read();
        match channels.get(&kind) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
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

    #[tokio::test]
    async fn test_subscriber_receives_matching_kind() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::JobCompleted);

        bus.emit(QueueEvent::JobCompleted {
            queue: "q".into(),
            job_id: "1".into(),
            return_value: None,
        });

        match rx.recv().await.unwrap() {
            QueueEvent::JobCompleted { job_id, .. } => assert_eq!(job_id, "1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let bus = EventBus::new();
        let mut completed = bus.subscribe(EventKind::JobCompleted);
        let _failed = bus.subscribe(EventKind::JobFailed);

        bus.emit(QueueEvent::JobFailed {
            queue: "q".into(),
            job_id: "1".into(),
            reason: "boom".into(),
        });

        assert!(matches!(
            completed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        let delivered = bus.emit(QueueEvent::Ready { queue: "q".into() });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe(EventKind::JobAdded);

        for i in 0..5 {
            bus.emit(QueueEvent::JobAdded {
                queue: "q".into(),
                job_id: i.to_string(),
            });
        }

        // The two newest events survive; the receiver observes the loss.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        match rx.recv().await.unwrap() {
            QueueEvent::JobAdded { job_id, .. } => assert_eq!(job_id, "3"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
