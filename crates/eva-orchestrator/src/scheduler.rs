use chrono::{DateTime, Utc};
use cron::Schedule;
use eva_core::{EvaError, EvaResult, SharedClock};
use eva_queue::{EnqueueOptions, QueueName, QueueStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// A recurring enqueue: `payload` goes into `queue` on every cron fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub cron_expression: String,
    pub queue: QueueName,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u8 {
    5
}

fn default_enabled() -> bool {
    true
}

/// Cron-based scheduler that enqueues each [`ScheduledJob`] when it fires.
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    next_fire: HashMap<String, DateTime<Utc>>,
    store: Arc<dyn QueueStore>,
    clock: SharedClock,
}

impl Scheduler {
    /// Validate every enabled job and compute its first fire time.
    pub fn new(
        jobs: Vec<ScheduledJob>,
        store: Arc<dyn QueueStore>,
        clock: SharedClock,
    ) -> EvaResult<Self> {
        let now = clock.now();
        let mut next_fire = HashMap::new();
        for job in jobs.iter().filter(|j| j.enabled) {
            if !(1..=10).contains(&job.priority) {
                return Err(EvaError::Config(format!(
                    "scheduled job '{}': priority must be between 1 and 10",
                    job.name
                )));
            }
            if next_fire
                .insert(
                    job.name.clone(),
                    Self::next_fire_after(&job.cron_expression, now)?,
                )
                .is_some()
            {
                return Err(EvaError::Config(format!(
                    "duplicate scheduled job name '{}'",
                    job.name
                )));
            }
        }
        Ok(Self {
            jobs,
            next_fire,
            store,
            clock,
        })
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
    pub fn parse_cron(cron_expr: &str) -> EvaResult<Schedule> {
        Schedule::from_str(cron_expr)
            .map_err(|e| EvaError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(cron_expr: &str, after: DateTime<Utc>) -> EvaResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(cron_expr)?;
        schedule.after(&after).next().ok_or_else(|| {
            EvaError::Config(format!(
                "Cron expression '{cron_expr}' has no upcoming fire times"
            ))
        })
    }

    /// Return references to only the enabled jobs.
    pub fn enabled_jobs(&self) -> Vec<&ScheduledJob> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    /// Return the total number of jobs (enabled and disabled).
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Earliest upcoming fire time across enabled jobs.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_fire.values().min().copied()
    }

    /// Enqueue every job whose fire time has passed. Returns how many fired.
    ///
    /// A job that missed several fire times fires once.
    pub async fn fire_due(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for job in self.jobs.iter().filter(|j| j.enabled) {
            let Some(due) = self.next_fire.get(&job.name).copied() else {
                continue;
            };
            if due > now {
                continue;
            }

            let options = EnqueueOptions::default()
                .priority(job.priority)
                .meta("scheduled_job", Value::String(job.name.clone()));
            match self
                .store
                .enqueue(job.queue, job.payload.clone(), options)
                .await
            {
                Ok(item) => {
                    fired += 1;
                    tracing::info!(job = %job.name, queue = %job.queue, item_id = %item.id, "Scheduler: job fired");
                }
                Err(e) => {
                    tracing::error!(job = %job.name, queue = %job.queue, error = %e, "Scheduler: enqueue failed");
                }
            }

            match Self::next_fire_after(&job.cron_expression, now) {
                Ok(next) => {
                    self.next_fire.insert(job.name.clone(), next);
                }
                Err(e) => {
                    tracing::warn!(job = %job.name, error = %e, "Scheduler: job has no further fire times");
                    self.next_fire.remove(&job.name);
                }
            }
        }
        fired
    }

    /// Start the scheduler background loop.
    ///
    /// Sleeps until the nearest fire time, enqueues due jobs, and repeats
    /// until `shutdown` turns true.
    pub fn start(mut self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(jobs = self.next_fire.len(), "Scheduler started");
            loop {
                let wait = match self.next_due() {
                    Some(next) => (next - self.clock.now())
                        .to_std()
                        .unwrap_or_default(),
                    None => std::time::Duration::from_secs(60),
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                self.fire_due().await;
            }
            tracing::info!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use eva_core::ManualClock;
    use eva_queue::{MemoryQueueStore, QueueStatus};
    use serde_json::json;

    fn job(name: &str, cron: &str, enabled: bool) -> ScheduledJob {
        ScheduledJob {
            name: name.into(),
            cron_expression: cron.into(),
            queue: QueueName::CrmSync,
            payload: json!({"sync": "contacts"}),
            priority: 5,
            enabled,
        }
    }

    #[test]
    fn test_parse_valid_cron() {
        let result = Scheduler::parse_cron("0 * * * * * *"); // every minute
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        let result = Scheduler::parse_cron("not a cron expression");
        assert!(result.is_err());
    }

    #[test]
    fn test_next_fire_after() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 10, 15, 30).unwrap();
        let next = Scheduler::next_fire_after("0 * * * * * *", t).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 4, 10, 16, 0).unwrap());
    }

    #[test]
    fn test_invalid_enabled_job_rejected() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::default());
        let res = Scheduler::new(
            vec![job("broken", "every tuesday", true)],
            store,
            eva_core::SystemClock::shared(),
        );
        assert!(matches!(res, Err(EvaError::Config(_))));
    }

    #[test]
    fn test_enabled_jobs_filter() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::default());
        let scheduler = Scheduler::new(
            vec![
                job("active", "0 * * * * * *", true),
                job("inactive", "not checked while disabled", false),
            ],
            store,
            eva_core::SystemClock::shared(),
        )
        .unwrap();
        assert_eq!(scheduler.job_count(), 2);
        assert_eq!(scheduler.enabled_jobs().len(), 1);
        assert_eq!(scheduler.enabled_jobs()[0].name, "active");
    }

    #[tokio::test]
    async fn test_fire_due_enqueues_once_per_fire() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 30).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store: Arc<dyn QueueStore> =
            Arc::new(MemoryQueueStore::new(Default::default(), clock.clone()));
        let mut scheduler = Scheduler::new(
            vec![job("crm", "0 * * * * * *", true)],
            store.clone(),
            clock.clone(),
        )
        .unwrap();

        assert_eq!(scheduler.fire_due().await, 0);
        clock.advance(Duration::seconds(30));
        assert_eq!(scheduler.fire_due().await, 1);
        assert_eq!(scheduler.fire_due().await, 0);
        assert_eq!(
            scheduler.next_due(),
            Some(Utc.with_ymd_and_hms(2026, 5, 4, 10, 2, 0).unwrap())
        );

        let items = store
            .list(QueueName::CrmSync, Some(QueueStatus::Pending))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata["scheduled_job"], json!("crm"));
        assert_eq!(items[0].payload, json!({"sync": "contacts"}));
    }
}
