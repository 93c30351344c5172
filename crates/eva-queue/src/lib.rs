//! Durable work queue for asynchronous agent tasks.
//!
//! Items are offered per queue in priority order, claimed atomically by one
//! processor at a time, retried with exponential jittered backoff, and parked
//! in a dead-letter store once their retry budget is spent.
//!
//! # Main types
//!
//! - [`QueueStore`] — Storage contract: enqueue, claim, complete, fail, dead letters.
//! - [`MemoryQueueStore`] — In-process store behind a single mutex.
//! - [`SqliteQueueStore`] — Single-file SQLite store with transactional claims.
//! - [`QueueItem`] / [`DeadLetterItem`] — The unit of work and its terminal-failure copy.
//! - [`QueueConfigs`] — Per-queue concurrency, retry, timeout and backoff settings.

/// Retry backoff policy.
pub mod backoff;
/// Per-queue settings and config-file overrides.
pub mod config;
/// Change notifications for dashboard subscribers.
pub mod events;
/// Queue statistics.
pub mod health;
/// Queue item, dead letter and enqueue option types.
pub mod item;
/// In-memory store.
pub mod memory;
/// SQLite store.
pub mod sqlite;
/// The `QueueStore` trait.
pub mod store;

pub use backoff::BackoffPolicy;
pub use config::{QueueConfig, QueueConfigs, QueueOverride};
pub use events::{EventBus, EventKind, QueueEvent};
pub use health::QueueHealth;
pub use item::{
    dispatch_order, DeadLetterItem, EnqueueOptions, FailOutcome, Failure, FailureRecord,
    QueueItem, QueueName, QueueStatus, MAX_DELAY_MS,
};
pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;
pub use store::{QueueStore, LEASE_EXPIRED};
