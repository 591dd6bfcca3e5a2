//! Platform event broker.
//!
//! Orchestrators publish lifecycle events through a small broker that copies
//! each event into every subscriber's bounded buffer. A slow subscriber
//! drops events instead of back-pressuring the call path; drops are counted
//! as a metric.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted by the call and ingestion orchestrators.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    CallStarted {
        session_id: String,
        agent_id: Option<String>,
        call_type: String,
    },
    CallAnswered {
        session_id: String,
    },
    CallEnded {
        session_id: String,
        duration_seconds: i64,
    },
    CallError {
        session_id: String,
        error: String,
    },
    LatencyExceeded {
        session_id: String,
        operation: String,
        duration_ms: u64,
        target_ms: u64,
    },
    IngestionStageChanged {
        session_id: String,
        stage: String,
        progress: u8,
    },
    Custom {
        name: String,
        payload: Value,
    },
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<PlatformEvent>,
}

/// Fan-out broker with bounded per-subscriber buffers.
pub struct EventBroker {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
}

impl EventBroker {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber and get its receiving end.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<PlatformEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().push(Subscriber {
            name: name.into(),
            tx,
        });
        rx
    }

    /// Publish an event to all live subscribers.
    ///
    /// Full buffers drop the event for that subscriber only; closed
    /// receivers are pruned.
    pub fn publish(&self, event: PlatformEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(
                    "callbridge_events_dropped",
                    "subscriber" => sub.name.clone()
                )
                .increment(1);
                tracing::debug!(subscriber = %sub.name, "Dropped event for slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let broker = EventBroker::new(8);
        let mut rx1 = broker.subscribe("a");
        let mut rx2 = broker.subscribe("b");

        broker.publish(PlatformEvent::CallAnswered {
            session_id: "s1".into(),
        });

        assert!(matches!(
            rx1.recv().await,
            Some(PlatformEvent::CallAnswered { .. })
        ));
        assert!(matches!(
            rx2.recv().await,
            Some(PlatformEvent::CallAnswered { .. })
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking() {
        let broker = EventBroker::new(1);
        let _rx = broker.subscribe("slow");

        // Second publish overflows the buffer of the unread subscriber and
        // must not block.
        broker.publish(PlatformEvent::CallAnswered {
            session_id: "s1".into(),
        });
        broker.publish(PlatformEvent::CallAnswered {
            session_id: "s2".into(),
        });
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let broker = EventBroker::new(4);
        let rx = broker.subscribe("gone");
        drop(rx);

        broker.publish(PlatformEvent::CallAnswered {
            session_id: "s1".into(),
        });
        assert_eq!(broker.subscriber_count(), 0);
    }
}
