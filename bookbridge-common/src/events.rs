//! Event types for the BookBridge event system
//!
//! Events are broadcast via [`EventBus`] and consumed by the admin API's
//! status endpoints and by tests observing engine behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Bridge event types
///
/// All cross-component notifications use this central enum for type safety
/// and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    /// A sync cycle finished for a book
    SyncCycleCompleted {
        book_id: String,
        leader: Option<String>,
        followers_updated: usize,
        timestamp: DateTime<Utc>,
    },

    /// A sync cycle was skipped (no contributing client, gates not met)
    SyncCycleSkipped {
        book_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Progress was written to a client
    ProgressWritten {
        book_id: String,
        client: String,
        percentage: f64,
        timestamp: DateTime<Utc>,
    },

    /// Mapping status changed
    StatusChanged {
        book_id: String,
        old_status: String,
        new_status: String,
        timestamp: DateTime<Utc>,
    },

    /// Transcription job progress update
    JobProgress {
        book_id: String,
        progress: f64,
        phase: String,
        timestamp: DateTime<Utc>,
    },

    /// A suggestion was created for an unmapped book
    SuggestionCreated {
        book_id: String,
        title: String,
        matches: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`BridgeEvent`]
///
/// Cheap to clone; subscribers receive events emitted after subscription.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Most emitters don't care whether anyone is listening; the admin UI
    /// may or may not have an open event stream.
    pub fn emit_lossy(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(BridgeEvent::SyncCycleSkipped {
            book_id: "b1".into(),
            reason: "no change".into(),
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            BridgeEvent::SyncCycleSkipped { book_id, .. } => assert_eq!(book_id, "b1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit_lossy(BridgeEvent::JobProgress {
            book_id: "b1".into(),
            progress: 0.5,
            phase: "transcribing".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
