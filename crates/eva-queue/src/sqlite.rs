use crate::config::QueueConfigs;
use crate::events::{EventBus, EventKind, QueueEvent};
use crate::health::QueueHealth;
use crate::item::{
    dispatch_order, DeadLetterItem, EnqueueOptions, FailOutcome, Failure, QueueItem, QueueName,
    QueueStatus,
};
use crate::store::{log_fail_outcome, QueueStore, LEASE_EXPIRED};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use eva_core::{EvaError, EvaResult, SharedClock};
use rusqlite::{params, Connection, OptionalExtension, Params, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_items (
    id TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    scheduled_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    lease_expires_at TEXT,
    item_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_items_due
    ON queue_items (queue_name, status, priority DESC, scheduled_at);
CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    original_item_id TEXT NOT NULL,
    queue_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    dead_letter_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_original ON dead_letters (original_item_id);
";

fn store_err(e: rusqlite::Error) -> EvaError {
    EvaError::Store(e.to_string())
}

/// Fixed-width UTC timestamp, so text comparison matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn query_json<P: Params>(conn: &Connection, sql: &str, params: P) -> EvaResult<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(store_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
}

fn parse_all<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> EvaResult<Vec<T>> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(EvaError::from))
        .collect()
}

fn load_item(conn: &Connection, id: Uuid) -> EvaResult<Option<QueueItem>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT item_json FROM queue_items WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?;
    json.map(|j| serde_json::from_str(&j).map_err(EvaError::from))
        .transpose()
}

fn require_item(conn: &Connection, id: Uuid) -> EvaResult<QueueItem> {
    load_item(conn, id)?.ok_or_else(|| EvaError::not_found("queue item", id))
}

fn save_item(conn: &Connection, item: &QueueItem) -> EvaResult<()> {
    let json = serde_json::to_string(item)?;
    conn.execute(
        "INSERT OR REPLACE INTO queue_items
            (id, queue_name, status, priority, scheduled_at, created_at, lease_expires_at, item_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            item.id.to_string(),
            item.queue_name.as_str(),
            item.status.as_str(),
            item.priority,
            ts(item.scheduled_at),
            ts(item.created_at),
            item.lease_expires_at.map(ts),
            json,
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

fn save_dead_letter(conn: &Connection, dead: &DeadLetterItem) -> EvaResult<()> {
    let json = serde_json::to_string(dead)?;
    conn.execute(
        "INSERT OR REPLACE INTO dead_letters
            (id, original_item_id, queue_name, created_at, dead_letter_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            dead.id.to_string(),
            dead.original_item_id.to_string(),
            dead.queue_name.as_str(),
            ts(dead.created_at),
            json,
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

/// Queue store persisted in a single SQLite database file.
///
/// Claims run inside `BEGIN IMMEDIATE` transactions with a
/// `WHERE status = 'pending'` guard, so separate processes sharing the file
/// never claim the same item twice.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
    configs: QueueConfigs,
    clock: SharedClock,
    events: EventBus,
}

impl SqliteQueueStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, configs: QueueConfigs, clock: SharedClock) -> EvaResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(store_err)?;
        info!(path = %path.display(), "Opened SQLite queue store");
        Self::with_connection(conn, configs, clock)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory(configs: QueueConfigs, clock: SharedClock) -> EvaResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn, configs, clock)
    }

    fn with_connection(
        conn: Connection,
        configs: QueueConfigs,
        clock: SharedClock,
    ) -> EvaResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            configs,
            clock,
            events: EventBus::new(),
        })
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

    /// Load, change and write back one item inside an immediate transaction.
    async fn update_item<T, F>(&self, id: Uuid, change: F) -> EvaResult<(QueueItem, T)>
    where
        F: FnOnce(&mut QueueItem) -> EvaResult<T> + Send,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;
        let mut item = require_item(&tx, id)?;
        let out = change(&mut item)?;
        save_item(&tx, &item)?;
        tx.commit().map_err(store_err)?;
        Ok((item, out))
    }

    /// Apply a failure to `id` within an open transaction.
    fn fail_in(
        &self,
        conn: &Connection,
        id: Uuid,
        failure: &Failure,
        now: DateTime<Utc>,
        events: &mut Vec<QueueEvent>,
    ) -> EvaResult<FailOutcome> {
        let mut item = require_item(conn, id)?;
        let backoff = self.configs.get(item.queue_name).backoff;
        let outcome = item.apply_failure(failure, now, &backoff)?;
        save_item(conn, &item)?;
        events.push(QueueEvent {
            queue: item.queue_name,
            kind: EventKind::Update,
            item_id: id,
            status: Some(item.status),
            at: now,
        });
        if let FailOutcome::DeadLettered(dead) = &outcome {
            save_dead_letter(conn, dead)?;
            events.push(QueueEvent {
                queue: item.queue_name,
                kind: EventKind::Insert,
                item_id: dead.id,
                status: Some(QueueStatus::Failed),
                at: now,
            });
        }
        log_fail_outcome(item.queue_name, id, &failure.message, &outcome);
        Ok(outcome)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let default_retries = self.configs.get(queue).max_retries;
        let item = QueueItem::new(queue, payload, options, default_retries, now)?;
        {
            let conn = self.conn.lock().await;
            save_item(&conn, &item)?;
        }
        info!(queue = %queue, item_id = %item.id, priority = item.priority, scheduled_at = %item.scheduled_at, "Queue item enqueued");
        self.events
            .emit(queue, EventKind::Insert, item.id, Some(item.status), now);
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

        let claimed = {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err)?;
            let candidates: Vec<QueueItem> = parse_all(query_json(
                &tx,
                "SELECT item_json FROM queue_items
                 WHERE queue_name = ?1 AND status = 'pending' AND scheduled_at <= ?2
                 ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
                 LIMIT ?3",
                params![queue.as_str(), ts(now), limit as i64],
            )?)?;

            let mut claimed = Vec::with_capacity(candidates.len());
            for mut item in candidates {
                item.claim(claimant, now, lease);
                let json = serde_json::to_string(&item)?;
                let changed = tx
                    .execute(
                        "UPDATE queue_items
                         SET status = 'processing', lease_expires_at = ?1, item_json = ?2
                         WHERE id = ?3 AND status = 'pending'",
                        params![item.lease_expires_at.map(ts), json, item.id.to_string()],
                    )
                    .map_err(store_err)?;
                if changed == 1 {
                    claimed.push(item);
                }
            }
            tx.commit().map_err(store_err)?;
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
        let (item, changed) = self
            .update_item(id, |item| item.mark_completed(result, now))
            .await?;
        if changed {
            info!(queue = %item.queue_name, item_id = %id, "Queue item completed");
            self.events.emit(
                item.queue_name,
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
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err)?;
            let outcome = self.fail_in(&tx, id, &failure, now, &mut events)?;
            tx.commit().map_err(store_err)?;
            outcome
        };
        self.emit(events);
        Ok(outcome)
    }

    async fn release(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let (item, ()) = self.update_item(id, QueueItem::release).await?;
        debug!(queue = %item.queue_name, item_id = %id, "Queue item released");
        self.events
            .emit(item.queue_name, EventKind::Update, id, Some(item.status), now);
        Ok(item)
    }

    async fn cancel(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let (item, ()) = self.update_item(id, QueueItem::cancel).await?;
        info!(queue = %item.queue_name, item_id = %id, "Queue item cancelled");
        self.events
            .emit(item.queue_name, EventKind::Update, id, Some(item.status), now);
        Ok(item)
    }

    async fn retry(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let (item, removed) = {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err)?;
            let mut item = require_item(&tx, id)?;
            item.reactivate(now)?;
            save_item(&tx, &item)?;
            let removed = query_json(
                &tx,
                "SELECT id FROM dead_letters WHERE original_item_id = ?1",
                params![id.to_string()],
            )?;
            tx.execute(
                "DELETE FROM dead_letters WHERE original_item_id = ?1",
                params![id.to_string()],
            )
            .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
            (item, removed)
        };

        info!(queue = %item.queue_name, item_id = %id, "Queue item manually retried");
        let mut events = vec![QueueEvent {
            queue: item.queue_name,
            kind: EventKind::Update,
            item_id: id,
            status: Some(item.status),
            at: now,
        }];
        for dead_id in removed {
            if let Ok(dead_id) = Uuid::parse_str(&dead_id) {
                events.push(QueueEvent {
                    queue: item.queue_name,
                    kind: EventKind::Delete,
                    item_id: dead_id,
                    status: None,
                    at: now,
                });
            }
        }
        self.emit(events);
        Ok(item)
    }

    async fn reclaim_expired(&self, queue: QueueName) -> EvaResult<Vec<(Uuid, FailOutcome)>> {
        let now = self.clock.now();
        let failure = Failure::transient(LEASE_EXPIRED);
        let mut events = Vec::new();
        let outcomes = {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err)?;
            let expired = query_json(
                &tx,
                "SELECT id FROM queue_items
                 WHERE queue_name = ?1 AND status = 'processing' AND lease_expires_at <= ?2",
                params![queue.as_str(), ts(now)],
            )?;
            let mut outcomes = Vec::with_capacity(expired.len());
            for raw in expired {
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| EvaError::Store(format!("corrupt item id '{raw}': {e}")))?;
                let outcome = self.fail_in(&tx, id, &failure, now, &mut events)?;
                outcomes.push((id, outcome));
            }
            tx.commit().map_err(store_err)?;
            outcomes
        };
        self.emit(events);
        Ok(outcomes)
    }

    async fn dead_letters(&self, queue: Option<QueueName>) -> EvaResult<Vec<DeadLetterItem>> {
        let conn = self.conn.lock().await;
        parse_all(query_json(
            &conn,
            "SELECT dead_letter_json FROM dead_letters
             WHERE (?1 IS NULL OR queue_name = ?1)
             ORDER BY created_at ASC, id ASC",
            params![queue.map(QueueName::as_str)],
        )?)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> EvaResult<QueueItem> {
        let now = self.clock.now();
        let item = {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err)?;
            let json: String = tx
                .query_row(
                    "SELECT dead_letter_json FROM dead_letters WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?
                .ok_or_else(|| EvaError::not_found("dead letter", id))?;
            let dead: DeadLetterItem = serde_json::from_str(&json)?;
            let item = QueueItem::new(
                dead.queue_name,
                dead.payload.clone(),
                dead.requeue_options(),
                self.configs.get(dead.queue_name).max_retries,
                now,
            )?;
            save_item(&tx, &item)?;
            if let Some(mut original) = load_item(&tx, dead.original_item_id)? {
                original.mark_requeued(item.id);
                save_item(&tx, &original)?;
            }
            tx.execute(
                "DELETE FROM dead_letters WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
            item
        };

        let queue = item.queue_name;
        info!(queue = %queue, dead_letter_id = %id, item_id = %item.id, "Dead letter requeued");
        self.events
            .emit(queue, EventKind::Insert, item.id, Some(item.status), now);
        self.events.emit(queue, EventKind::Delete, id, None, now);
        Ok(item)
    }

    async fn get(&self, id: Uuid) -> EvaResult<Option<QueueItem>> {
        let conn = self.conn.lock().await;
        load_item(&conn, id)
    }

    async fn list(
        &self,
        queue: QueueName,
        status: Option<QueueStatus>,
    ) -> EvaResult<Vec<QueueItem>> {
        let conn = self.conn.lock().await;
        let mut items: Vec<QueueItem> = parse_all(query_json(
            &conn,
            "SELECT item_json FROM queue_items
             WHERE queue_name = ?1 AND (?2 IS NULL OR status = ?2)",
            params![queue.as_str(), status.map(QueueStatus::as_str)],
        )?)?;
        items.sort_by(dispatch_order);
        Ok(items)
    }

    async fn health(&self, queue: QueueName) -> EvaResult<QueueHealth> {
        let conn = self.conn.lock().await;
        let items: Vec<QueueItem> = parse_all(query_json(
            &conn,
            "SELECT item_json FROM queue_items WHERE queue_name = ?1",
            params![queue.as_str()],
        )?)?;
        let dead: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE queue_name = ?1",
                params![queue.as_str()],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(QueueHealth::from_items(queue, &items, dead.max(0) as usize))
    }

    fn subscribe(&self, queue: QueueName) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe(queue)
    }
}
