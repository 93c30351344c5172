use crate::config::QueueConfigs;
use crate::events::{EventBus, EventKind, QueueEvent};
use crate::health::QueueHealth;
use crate::item::{
    dispatch_order, DeadLetterItem, EnqueueOptions, FailOutcome, Failure, QueueItem, QueueName,
    QueueStatus,
};
use crate::store::{log_fail_outcome, QueueStore, LEASE_EXPIRED};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eva_core::{EvaError, EvaResult, SharedClock, SystemClock};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    items: HashMap<Uuid, QueueItem>,
    dead_letters: HashMap<Uuid, DeadLetterItem>,
}

impl Tables {
    fn item_mut(&mut self, id: Uuid) -> EvaResult<&mut QueueItem> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| EvaError::not_found("queue item", id))
    }
}

/// In-process queue store. All claims and transitions run under one mutex.
pub struct MemoryQueueStore {
    tables: Mutex<Tables>,
    configs: QueueConfigs,
    clock: SharedClock,
    events: EventBus,
}

impl MemoryQueueStore {
    /// An empty store.
    pub fn new(configs: QueueConfigs, clock: SharedClock) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            configs,
            clock,
            events: EventBus::new(),
        }
    }

    /// Per-queue settings.
    pub fn configs(&self) -> &QueueConfigs {
        &self.configs
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    fn event(
        queue: QueueName,
        kind: EventKind,
        item_id: Uuid,
        status: Option<QueueStatus>,
        at: DateTime<Utc>,
    ) -> QueueEvent {
        QueueEvent {
            queue,
            kind,
            item_id,
            status,
            at,
        }
    }

    /// Apply a failure to `id` while `tables` is held, recording any dead letter.
    fn fail_locked(
        &self,
        tables: &mut Tables,
        id: Uuid,
        failure: &Failure,
        now: DateTime<Utc>,
        events: &mut Vec<QueueEvent>,
    ) -> EvaResult<FailOutcome> {
        let item = tables.item_mut(id)?;
        let backoff = self.configs.get(item.queue_name).backoff;
        let outcome = item.apply_failure(failure, now, &backoff)?;
        let queue = item.queue_name;
        events.push(Self::event(
            queue,
            EventKind::Update,
            id,
            Some(item.status),
            now,
        ));
        if let FailOutcome::DeadLettered(dead) = &outcome {
            tables.dead_letters.insert(dead.id, dead.clone());
            events.push(Self::event(
                queue,
                EventKind::Insert,
                dead.id,
                Some(QueueStatus::Failed),
                now,
            ));
        }
        log_fail_outcome(queue, id, &failure.message, &outcome);
        Ok(outcome)
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new(QueueConfigs::default(), SystemClock::shared())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let default_retries = self.configs.get(queue).max_retries;
        let item = QueueItem::new(queue, payload, options, default_retries, now)?;
        self.tables.lock().items.insert(item.id, item.clone());

        info!(queue = %queue, item_id = %item.id, priority = item.priority, scheduled_at = %item.scheduled_at, "Queue item enqueued");
        self.events.emit(
            queue,
            EventKind::Insert,
            item.id,
            Some(item.status),
            now,
        );
        Ok(item)
    }

    async fn dequeue_due(
        &self,
        queue: QueueName,
        limit: usize,
        claimant: &str,
    ) -> EvaResult<Vec<QueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let lease = self.configs.get(queue).lease();

        let claimed: Vec<QueueItem> = {
            let mut tables = self.tables.lock();
            let mut due: Vec<&QueueItem> = tables
                .items
                .values()
                .filter(|i| i.queue_name == queue && i.is_due(now))
                .collect();
            due.sort_by(|a, b| dispatch_order(a, b));
            let ids: Vec<Uuid> = due.into_iter().take(limit).map(|i| i.id).collect();

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                let item = tables.item_mut(id)?;
                item.claim(claimant, now, lease);
                claimed.push(item.clone());
            }
            claimed
        };

        for item in &claimed {
            debug!(queue = %queue, item_id = %item.id, claimant, "Queue item claimed");
            self.events.emit(
                queue,
                EventKind::Update,
                item.id,
                Some(QueueStatus::Processing),
                now,
            );
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, result: Value) -> EvaResult<bool> {
        let now = self.clock.now();
        let (queue, changed) = {
            let mut tables = self.tables.lock();
            let item = tables.item_mut(id)?;
            let changed = item.mark_completed(result, now)?;
            (item.queue_name, changed)
        };
        if changed {
            info!(queue = %queue, item_id = %id, "Queue item completed");
            self.events.emit(
                queue,
                EventKind::Update,
                id,
                Some(QueueStatus::Completed),
                now,
            );
        }
        Ok(changed)
    }

    async fn fail(&self, id: Uuid, failure: Failure) -> EvaResult<FailOutcome> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let outcome = {
            let mut tables = self.tables.lock();
            self.fail_locked(&mut tables, id, &failure, now, &mut events)?
        };
        self.emit(events);
        Ok(outcome)
    }

    async fn release(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let item = {
            let mut tables = self.tables.lock();
            let item = tables.item_mut(id)?;
            item.release()?;
            item.clone()
        };
        debug!(queue = %item.queue_name, item_id = %id, "Queue item released");
        self.events.emit(
            item.queue_name,
            EventKind::Update,
            id,
            Some(item.status),
            now,
        );
        Ok(item)
    }

    async fn cancel(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let item = {
            let mut tables = self.tables.lock();
            let item = tables.item_mut(id)?;
            item.cancel()?;
            item.clone()
        };
        info!(queue = %item.queue_name, item_id = %id, "Queue item cancelled");
        self.events.emit(
            item.queue_name,
            EventKind::Update,
            id,
            Some(item.status),
            now,
        );
        Ok(item)
    }

    async fn retry(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let (item, removed) = {
            let mut tables = self.tables.lock();
            let item = tables.item_mut(id)?;
            item.reactivate(now)?;
            let item = item.clone();
            let removed: Vec<Uuid> = tables
                .dead_letters
                .values()
                .filter(|d| d.original_item_id == id)
                .map(|d| d.id)
                .collect();
            for dead_id in &removed {
                tables.dead_letters.remove(dead_id);
            }
            (item, removed)
        };

        info!(queue = %item.queue_name, item_id = %id, "Queue item manually retried");
        let mut events = vec![Self::event(
            item.queue_name,
            EventKind::Update,
            id,
            Some(item.status),
            now,
        )];
        events.extend(
            removed
                .into_iter()
                .map(|dead_id| Self::event(item.queue_name, EventKind::Delete, dead_id, None, now)),
        );
        self.emit(events);
        Ok(item)
    }

    async fn reclaim_expired(&self, queue: QueueName) -> EvaResult<Vec<(Uuid, FailOutcome)>> {
        let now = self.clock.now();
        let failure = Failure::transient(LEASE_EXPIRED);
        let mut events = Vec::new();
        let outcomes = {
            let mut tables = self.tables.lock();
            let expired: Vec<Uuid> = tables
                .items
                .values()
                .filter(|i| i.queue_name == queue && i.lease_expired(now))
                .map(|i| i.id)
                .collect();
            let mut outcomes = Vec::with_capacity(expired.len());
            for id in expired {
                let outcome = self.fail_locked(&mut tables, id, &failure, now, &mut events)?;
                outcomes.push((id, outcome));
            }
            outcomes
        };
        self.emit(events);
        Ok(outcomes)
    }

    async fn dead_letters(&self, queue: Option<QueueName>) -> EvaResult<Vec<DeadLetterItem>> {
        let mut dead: Vec<DeadLetterItem> = self
            .tables
            .lock()
            .dead_letters
            .values()
            .filter(|d| queue.map_or(true, |q| d.queue_name == q))
            .cloned()
            .collect();
        dead.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(dead)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let (item, queue) = {
            let mut tables = self.tables.lock();
            let dead = tables
                .dead_letters
                .get(&id)
                .ok_or_else(|| EvaError::not_found("dead letter", id))?;
            let queue = dead.queue_name;
            let item = QueueItem::new(
                queue,
                dead.payload.clone(),
                dead.requeue_options(),
                self.configs.get(queue).max_retries,
                now,
            )?;
            let original_id = dead.original_item_id;
            tables.items.insert(item.id, item.clone());
            tables.dead_letters.remove(&id);
            if let Some(original) = tables.items.get_mut(&original_id) {
                original.mark_requeued(item.id);
            }
            (item, queue)
        };

        info!(queue = %queue, dead_letter_id = %id, item_id = %item.id, "Dead letter requeued");
        self.emit(vec![
            Self::event(queue, EventKind::Insert, item.id, Some(item.status), now),
            Self::event(queue, EventKind::Delete, id, None, now),
        ]);
        Ok(item)
    }

    async fn get(&self, id: Uuid) -> EvaResult<Option<QueueItem>> {
        Ok(self.tables.lock().items.get(&id).cloned())
    }

    async fn list(
        &self,
        queue: QueueName,
        status: Option<QueueStatus>,
    ) -> EvaResult<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self
            .tables
            .lock()
            .items
            .values()
            .filter(|i| i.queue_name == queue && status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        items.sort_by(dispatch_order);
        Ok(items)
    }

    async fn health(&self, queue: QueueName) -> EvaResult<QueueHealth> {
        let tables = self.tables.lock();
        let dead = tables
            .dead_letters
            .values()
            .filter(|d| d.queue_name == queue)
            .count();
        Ok(QueueHealth::from_items(
            queue,
            tables.items.values().filter(|i| i.queue_name == queue),
            dead,
        ))
    }

    fn subscribe(&self, queue: QueueName) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe(queue)
    }
}
