use crate::item::{QueueName, QueueStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 256;

/// Kind of change applied to a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Notification that a queue item (or dead letter) changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub queue: QueueName,
    pub kind: EventKind,
    pub item_id: Uuid,
    /// New status, absent for deletions.
    pub status: Option<QueueStatus>,
    pub at: DateTime<Utc>,
}

/// Per-queue broadcast topics for dashboard subscribers.
///
/// Notify-only: a lagging receiver loses events, and publishing with no
/// subscribers is not an error.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<QueueName, broadcast::Sender<QueueEvent>>>,
}

impl EventBus {
    /// One channel per known queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: QueueName) -> broadcast::Sender<QueueEvent> {
        self.topics
            .lock()
            .entry(queue)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Receive future events for `queue`.
    pub fn subscribe(&self, queue: QueueName) -> broadcast::Receiver<QueueEvent> {
        self.sender(queue).subscribe()
    }

    /// Fan out an event; having no subscribers is fine.
    pub fn publish(&self, event: QueueEvent) {
        let tx = self.sender(event.queue);
        // Err only means nobody is listening.
        let _ = tx.send(event);
    }

    /// Shorthand for publishing a change to `item_id`.
    pub fn emit(
        &self,
        queue: QueueName,
        kind: EventKind,
        item_id: Uuid,
        status: Option<QueueStatus>,
        at: DateTime<Utc>,
    ) {
        self.publish(QueueEvent {
            queue,
            kind,
            item_id,
            status,
            at,
        });
    }
}
