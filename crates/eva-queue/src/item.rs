use crate::backoff::BackoffPolicy;
use chrono::{DateTime, Duration, Utc};
use eva_core::{EvaError, EvaResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::str::FromStr;
use uuid::Uuid;

/// Upper bound for enqueue delays, processing leases and retry backoff: 366 days.
pub const MAX_DELAY_MS: u64 = 366 * 24 * 60 * 60 * 1_000;

/// Millisecond count as a signed delta, saturating instead of wrapping.
pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// `now + delta`, pinned to the latest representable instant on overflow.
fn saturating_after(now: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The known work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Job-board and web search integrations.
    Search,
    /// LLM content generation.
    ContentGeneration,
    /// Resume and document parsing.
    ResumeParsing,
    /// Personalised outreach messages.
    Outreach,
    /// CRM synchronisation.
    CrmSync,
    /// User-facing notifications.
    Notifications,
}

impl QueueName {
    /// Every known queue.
    pub const ALL: [QueueName; 6] = [
        QueueName::Search,
        QueueName::ContentGeneration,
        QueueName::ResumeParsing,
        QueueName::Outreach,
        QueueName::CrmSync,
        QueueName::Notifications,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Search => "search",
            QueueName::ContentGeneration => "content_generation",
            QueueName::ResumeParsing => "resume_parsing",
            QueueName::Outreach => "outreach",
            QueueName::CrmSync => "crm_sync",
            QueueName::Notifications => "notifications",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = EvaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| EvaError::Validation(format!("unknown queue '{s}'")))
    }
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = EvaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            other => Err(EvaError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: String,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

/// Why an attempt failed, and whether trying again could help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub retryable: bool,
}

impl Failure {
    /// Network/API style failure; retried with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Malformed input or similar; dead-lettered without further attempts.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// What [`crate::QueueStore::fail`] did with the item.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back to pending, eligible again at `next_attempt_at`.
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries exhausted (or failure permanent); parked in the dead-letter store.
    DeadLettered(DeadLetterItem),
}

impl FailOutcome {
    /// Whether the item ended in the dead-letter store.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered(_))
    }
}

/// Options for [`crate::QueueStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: u8,
    pub delay: Duration,
    /// Falls back to the queue's configured default.
    pub max_retries: Option<u32>,
    pub metadata: Map<String, Value>,
    pub owner: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay: Duration::zero(),
            max_retries: None,
            metadata: Map::new(),
            owner: None,
            workflow_id: None,
        }
    }
}

impl EnqueueOptions {
    /// Priority 1-10, higher first.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the item back for `ms` milliseconds.
    pub fn delay_ms(mut self, ms: i64) -> Self {
        self.delay = Duration::milliseconds(ms);
        self
    }

    /// Override the queue's retry budget.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Tenant that owns the item.
    pub fn owner(mut self, user_id: Uuid) -> Self {
        self.owner = Some(user_id);
        self
    }

    /// Roll the item's outcome into a workflow.
    pub fn workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Add one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn validate(&self) -> EvaResult<()> {
        if !(1..=10).contains(&self.priority) {
            return Err(EvaError::Validation(format!(
                "priority must be between 1 and 10, got {}",
                self.priority
            )));
        }
        if self.delay < Duration::zero() {
            return Err(EvaError::Validation("delay must not be negative".into()));
        }
        if self.delay > millis(MAX_DELAY_MS) {
            return Err(EvaError::Validation(format!(
                "delay must not exceed {MAX_DELAY_MS} ms"
            )));
        }
        Ok(())
    }
}

/// A unit of work submitted to a named queue.
///
/// Serializes to the boundary JSON shape consumed by dashboards; bookkeeping
/// fields beyond that shape are omitted while empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub queue_name: QueueName,
    #[serde(rename = "user_id")]
    pub owner: Option<Uuid>,
    /// Opaque to the queue; only the worker interprets it.
    pub payload: Value,
    pub priority: u8,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "error_message")]
    pub error: Option<String>,
    pub result: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_history: Vec<FailureRecord>,
    /// Set once the item's dead letter has been requeued as a fresh item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_as: Option<Uuid>,
}

impl QueueItem {
    pub(crate) fn new(
        queue_name: QueueName,
        payload: Value,
        options: EnqueueOptions,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> EvaResult<Self> {
        options.validate()?;
        let scheduled_at = now
            .checked_add_signed(options.delay)
            .ok_or_else(|| EvaError::Validation("scheduled time is out of range".into()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            queue_name,
            owner: options.owner,
            payload,
            priority: options.priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            scheduled_at,
            processed_at: None,
            completed_at: None,
            error: None,
            result: None,
            metadata: options.metadata,
            created_at: now,
            workflow_id: options.workflow_id,
            claimed_by: None,
            lease_expires_at: None,
            failure_history: Vec::new(),
            requeued_as: None,
        })
    }

    fn reject(&self, to: QueueStatus) -> EvaError {
        EvaError::invalid_transition("queue item", self.id, self.status, to)
    }

    /// Pending and past its scheduled time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.scheduled_at <= now
    }

    /// Processing with a lease that has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing
            && self.lease_expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Pending -> processing, owned by `claimant` until the lease runs out.
    pub(crate) fn claim(&mut self, claimant: &str, now: DateTime<Utc>, lease: Duration) {
        self.status = QueueStatus::Processing;
        self.processed_at = Some(now);
        self.claimed_by = Some(claimant.to_string());
        self.lease_expires_at = Some(saturating_after(now, lease));
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.lease_expires_at = None;
    }

    /// Processing -> completed. Completing a completed item is a no-op (`false`).
    pub(crate) fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) -> EvaResult<bool> {
        match self.status {
            QueueStatus::Completed => Ok(false),
            QueueStatus::Processing => {
                self.status = QueueStatus::Completed;
                self.completed_at = Some(now);
                self.result = Some(result);
                self.error = None;
                self.clear_claim();
                Ok(true)
            }
            _ => Err(self.reject(QueueStatus::Completed)),
        }
    }

    /// Record a failed attempt and either schedule a retry or dead-letter.
    pub(crate) fn apply_failure(
        &mut self,
        failure: &Failure,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> EvaResult<FailOutcome> {
        if self.status != QueueStatus::Processing {
            return Err(self.reject(QueueStatus::Failed));
        }

        self.failure_history.push(FailureRecord {
            attempt: self.retry_count + 1,
            error: failure.message.clone(),
            retryable: failure.retryable,
            failed_at: now,
        });
        self.error = Some(failure.message.clone());
        self.clear_claim();

        if failure.retryable && self.retry_count < self.max_retries {
            self.retry_count += 1;
            let delay = millis(backoff.delay_ms(self.retry_count));
            self.status = QueueStatus::Pending;
            self.scheduled_at = saturating_after(now, delay);
            self.processed_at = None;
            return Ok(FailOutcome::Retrying {
                retry_count: self.retry_count,
                next_attempt_at: self.scheduled_at,
            });
        }

        self.status = QueueStatus::Failed;
        Ok(FailOutcome::DeadLettered(DeadLetterItem::from_item(self, now)))
    }

    /// Processing -> pending without consuming a retry.
    pub(crate) fn release(&mut self) -> EvaResult<()> {
        if self.status != QueueStatus::Processing {
            return Err(self.reject(QueueStatus::Pending));
        }
        self.status = QueueStatus::Pending;
        self.processed_at = None;
        self.clear_claim();
        Ok(())
    }

    /// Link a dead-lettered item to the item that replaced it.
    pub(crate) fn mark_requeued(&mut self, successor: Uuid) {
        self.requeued_as = Some(successor);
    }

    /// Pending -> cancelled. Anything else is rejected.
    pub(crate) fn cancel(&mut self) -> EvaResult<()> {
        if self.status != QueueStatus::Pending {
            return Err(self.reject(QueueStatus::Cancelled));
        }
        self.status = QueueStatus::Cancelled;
        Ok(())
    }

    /// Failed -> pending, due immediately, with a fresh retry budget.
    /// Items whose dead letter was already requeued stay failed.
    pub(crate) fn reactivate(&mut self, now: DateTime<Utc>) -> EvaResult<()> {
        if self.status != QueueStatus::Failed {
            return Err(self.reject(QueueStatus::Pending));
        }
        if let Some(successor) = self.requeued_as {
            return Err(EvaError::Validation(format!(
                "queue item {} was already requeued as {successor}",
                self.id
            )));
        }
        self.status = QueueStatus::Pending;
        self.scheduled_at = now;
        self.processed_at = None;
        self.completed_at = None;
        self.error = None;
        self.retry_count = 0;
        Ok(())
    }
}

/// Offer order within a queue: priority desc, then scheduled_at asc.
/// created_at and id make the order total.
pub fn dispatch_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// A queue item that permanently failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: Uuid,
    pub original_item_id: Uuid,
    pub queue_name: QueueName,
    #[serde(rename = "user_id")]
    pub owner: Option<Uuid>,
    pub payload: Value,
    pub priority: u8,
    pub failure_history: Vec<FailureRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterItem {
    pub(crate) fn from_item(item: &QueueItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_item_id: item.id,
            queue_name: item.queue_name,
            owner: item.owner,
            payload: item.payload.clone(),
            priority: item.priority,
            failure_history: item.failure_history.clone(),
            metadata: item.metadata.clone(),
            workflow_id: item.workflow_id,
            created_at: now,
        }
    }

    /// Most recent failure message.
    pub fn last_error(&self) -> Option<&str> {
        self.failure_history.last().map(|f| f.error.as_str())
    }

    /// Options that re-enqueue this payload as a fresh item pointing back here.
    pub(crate) fn requeue_options(&self) -> EnqueueOptions {
        let mut options = EnqueueOptions::default().priority(self.priority.clamp(1, 10));
        options.metadata = self.metadata.clone();
        options.owner = self.owner;
        options.workflow_id = self.workflow_id;
        options
            .meta("dead_letter_id", Value::String(self.id.to_string()))
            .meta(
                "original_item_id",
                Value::String(self.original_item_id.to_string()),
            )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.0,
        }
    }

    fn item(max_retries: u32) -> QueueItem {
        QueueItem::new(
            QueueName::Search,
            json!({"query": "rust engineer"}),
            EnqueueOptions::default().max_retries(max_retries),
            3,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_item_defaults() {
        let now = Utc::now();
        let it = QueueItem::new(
            QueueName::Outreach,
            json!({}),
            EnqueueOptions::default().delay_ms(5_000),
            4,
            now,
        )
        .unwrap();
        assert_eq!(it.status, QueueStatus::Pending);
        assert_eq!(it.priority, 5);
        assert_eq!(it.max_retries, 4);
        assert_eq!(it.scheduled_at, now + Duration::seconds(5));
        assert!(!it.is_due(now));
        assert!(it.is_due(now + Duration::seconds(5)));
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let res = QueueItem::new(
            QueueName::Search,
            json!({}),
            EnqueueOptions::default().priority(11),
            3,
            Utc::now(),
        );
        assert!(matches!(res, Err(EvaError::Validation(_))));
    }

    #[test]
    fn test_oversized_delay_rejected() {
        for ms in [i64::MAX, MAX_DELAY_MS as i64 + 1] {
            let res = QueueItem::new(
                QueueName::Search,
                json!({}),
                EnqueueOptions::default().delay_ms(ms),
                3,
                Utc::now(),
            );
            assert!(matches!(res, Err(EvaError::Validation(_))), "delay {ms}");
        }
        assert!(QueueItem::new(
            QueueName::Search,
            json!({}),
            EnqueueOptions::default().delay_ms(MAX_DELAY_MS as i64),
            3,
            Utc::now(),
        )
        .is_ok());
    }

    #[test]
    fn test_schedule_near_end_of_time_rejected() {
        let res = QueueItem::new(
            QueueName::Search,
            json!({}),
            EnqueueOptions::default().delay_ms(1_000),
            3,
            DateTime::<Utc>::MAX_UTC,
        );
        assert!(matches!(res, Err(EvaError::Validation(_))));
    }

    #[test]
    fn test_huge_lease_and_backoff_saturate() {
        let now = Utc::now();
        let mut it = item(3);
        it.claim("p", now, millis(u64::MAX));
        assert_eq!(it.lease_expires_at, Some(DateTime::<Utc>::MAX_UTC));

        let huge = BackoffPolicy {
            base_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            jitter: 0.0,
        };
        let outcome = it.apply_failure(&Failure::transient("503"), now, &huge).unwrap();
        assert!(!outcome.is_dead_lettered());
        assert_eq!(it.scheduled_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_failure_schedules_backoff() {
        let now = Utc::now();
        let mut it = item(3);
        it.claim("p-1", now, Duration::seconds(30));
        let outcome = it
            .apply_failure(&Failure::transient("503"), now, &no_jitter())
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                retry_count: 1,
                next_attempt_at: now + Duration::seconds(1)
            }
        );
        assert_eq!(it.status, QueueStatus::Pending);
        assert!(it.processed_at.is_none());
        assert!(it.claimed_by.is_none());
        assert_eq!(it.failure_history.len(), 1);

        it.claim("p-1", now, Duration::seconds(30));
        it.apply_failure(&Failure::transient("503"), now, &no_jitter())
            .unwrap();
        assert_eq!(it.scheduled_at, now + Duration::seconds(2));
    }

    #[test]
    fn test_exhausted_retries_dead_letter() {
        let now = Utc::now();
        let mut it = item(1);
        it.claim("p", now, Duration::seconds(30));
        assert!(!it
            .apply_failure(&Failure::transient("a"), now, &no_jitter())
            .unwrap()
            .is_dead_lettered());
        it.claim("p", now, Duration::seconds(30));
        let outcome = it
            .apply_failure(&Failure::transient("b"), now, &no_jitter())
            .unwrap();
        let FailOutcome::DeadLettered(dead) = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(it.status, QueueStatus::Failed);
        assert_eq!(it.retry_count, 1);
        assert_eq!(dead.original_item_id, it.id);
        assert_eq!(dead.payload, it.payload);
        assert_eq!(dead.failure_history.len(), 2);
        assert_eq!(dead.last_error(), Some("b"));
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let now = Utc::now();
        let mut it = item(5);
        it.claim("p", now, Duration::seconds(30));
        let outcome = it
            .apply_failure(&Failure::permanent("malformed payload"), now, &no_jitter())
            .unwrap();
        assert!(outcome.is_dead_lettered());
        assert_eq!(it.retry_count, 0);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let now = Utc::now();
        let mut it = item(3);
        it.claim("p", now, Duration::seconds(30));
        assert!(it.mark_completed(json!({"ok": 1}), now).unwrap());
        assert!(!it.mark_completed(json!({"ok": 2}), now).unwrap());
        assert_eq!(it.result, Some(json!({"ok": 1})));
    }

    #[test]
    fn test_cannot_complete_pending() {
        let mut it = item(3);
        assert!(it
            .mark_completed(json!(null), Utc::now())
            .unwrap_err()
            .is_invalid_transition());
    }

    #[test]
    fn test_cancel_only_pending() {
        let now = Utc::now();
        let mut pending = item(3);
        assert!(pending.cancel().is_ok());
        assert_eq!(pending.status, QueueStatus::Cancelled);
        assert!(pending.cancel().is_err());

        let mut processing = item(3);
        processing.claim("p", now, Duration::seconds(30));
        assert!(processing.cancel().is_err());
        assert_eq!(processing.status, QueueStatus::Processing);
    }

    #[test]
    fn test_requeued_item_cannot_be_reactivated() {
        let now = Utc::now();
        let mut it = item(0);
        it.claim("p", now, Duration::seconds(30));
        it.apply_failure(&Failure::permanent("bad"), now, &no_jitter())
            .unwrap();
        it.mark_requeued(Uuid::new_v4());
        assert!(matches!(it.reactivate(now), Err(EvaError::Validation(_))));
        assert_eq!(it.status, QueueStatus::Failed);
        assert!(serde_json::to_value(&it).unwrap().get("requeued_as").is_some());
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let mut it = item(3);
        it.claim("p", now, Duration::seconds(10));
        assert!(!it.lease_expired(now + Duration::seconds(9)));
        assert!(it.lease_expired(now + Duration::seconds(10)));
    }

    #[test]
    fn test_dispatch_order() {
        let now = Utc::now();
        let mut low = item(3);
        low.priority = 3;
        let mut high = item(3);
        high.priority = 9;
        let mut early_high = item(3);
        early_high.priority = 9;
        early_high.scheduled_at = now - Duration::seconds(10);

        let mut items = [low.clone(), high.clone(), early_high.clone()];
        items.sort_by(dispatch_order);
        assert_eq!(items[0].id, early_high.id);
        assert_eq!(items[1].id, high.id);
        assert_eq!(items[2].id, low.id);
    }

    #[test]
    fn test_boundary_json_shape() {
        let it = item(3);
        let json = serde_json::to_value(&it).unwrap();
        for key in [
            "id",
            "queue_name",
            "user_id",
            "payload",
            "priority",
            "status",
            "retry_count",
            "max_retries",
            "scheduled_at",
            "processed_at",
            "completed_at",
            "error_message",
            "result",
            "metadata",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["status"], "pending");
        assert_eq!(json["queue_name"], "search");
        assert!(json.get("failure_history").is_none());
    }

    #[test]
    fn test_queue_name_parse() {
        assert_eq!(
            "resume_parsing".parse::<QueueName>().unwrap(),
            QueueName::ResumeParsing
        );
        assert!("bogus".parse::<QueueName>().is_err());
    }
}
