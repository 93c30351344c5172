use crate::events::QueueEvent;
use crate::health::QueueHealth;
use crate::item::{
    DeadLetterItem, EnqueueOptions, FailOutcome, Failure, QueueItem, QueueName, QueueStatus,
};
use async_trait::async_trait;
use eva_core::EvaResult;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Durable prioritized queue with retry and dead-letter handling.
///
/// Every state change is atomic with respect to concurrent callers of the
/// same store: an item is claimed by at most one `dequeue_due` caller, and a
/// failure either schedules a retry or creates exactly one dead letter.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create a pending item due at `now + options.delay`.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> EvaResult<QueueItem>;

    /// Claim up to `limit` due items for `claimant`, in dispatch order.
    async fn dequeue_due(
        &self,
        queue: QueueName,
        limit: usize,
        claimant: &str,
    ) -> EvaResult<Vec<QueueItem>>;

    /// Processing -> completed. Returns `false` if it was already completed.
    async fn complete(&self, id: Uuid, result: Value) -> EvaResult<bool>;

    /// Record a failed attempt: retry with backoff or dead-letter.
    async fn fail(&self, id: Uuid, failure: Failure) -> EvaResult<FailOutcome>;

    /// Processing -> pending without consuming a retry.
    async fn release(&self, id: Uuid) -> EvaResult<QueueItem>;

    /// Pending -> cancelled.
    async fn cancel(&self, id: Uuid) -> EvaResult<QueueItem>;

    /// Failed -> pending with a fresh retry budget; drops the matching dead letter.
    /// Rejected once the item's dead letter has been requeued.
    async fn retry(&self, id: Uuid) -> EvaResult<QueueItem>;

    /// Push items whose processing lease ran out through the failure path.
    async fn reclaim_expired(&self, queue: QueueName) -> EvaResult<Vec<(Uuid, FailOutcome)>>;

    /// Dead letters, oldest first, optionally for one queue.
    async fn dead_letters(&self, queue: Option<QueueName>) -> EvaResult<Vec<DeadLetterItem>>;

    /// Re-enqueue a dead letter's payload as a fresh item and delete the dead letter.
    /// The archived original records the replacement in `requeued_as`.
    async fn requeue_dead_letter(&self, id: Uuid) -> EvaResult<QueueItem>;

    async fn get(&self, id: Uuid) -> EvaResult<Option<QueueItem>>;

    /// Items in `queue`, optionally filtered by status, in dispatch order.
    async fn list(
        &self,
        queue: QueueName,
        status: Option<QueueStatus>,
    ) -> EvaResult<Vec<QueueItem>>;

    async fn health(&self, queue: QueueName) -> EvaResult<QueueHealth>;

    /// Change notifications for `queue`.
    fn subscribe(&self, queue: QueueName) -> broadcast::Receiver<QueueEvent>;
}

/// Message recorded when a processing lease runs out.
pub const LEASE_EXPIRED: &str = "lease expired";

pub(crate) fn log_fail_outcome(queue: QueueName, id: Uuid, error: &str, outcome: &FailOutcome) {
    match outcome {
        FailOutcome::Retrying {
            retry_count,
            next_attempt_at,
        } => tracing::warn!(
            queue = %queue,
            item_id = %id,
            retry_count,
            next_attempt_at = %next_attempt_at,
            error,
            "Queue item failed, retry scheduled"
        ),
        FailOutcome::DeadLettered(dead) => tracing::error!(
            queue = %queue,
            item_id = %id,
            dead_letter_id = %dead.id,
            attempts = dead.failure_history.len(),
            error,
            "Queue item moved to dead letters"
        ),
    }
}
