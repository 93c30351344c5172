use crate::dispatcher::Dispatcher;
use crate::workflow::WorkflowTracker;
use async_trait::async_trait;
use eva_agents::AgentTask;
use eva_core::{EvaError, EvaResult};
use eva_queue::{EventKind, FailOutcome, Failure, QueueConfig, QueueItem, QueueName, QueueStore};
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error returned by a [`QueueHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// `false` sends the item straight to the dead-letter store.
    pub retryable: bool,
}

impl HandlerError {
    /// Network, rate limit or upstream outage.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Malformed input or anything another attempt cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<HandlerError> for Failure {
    fn from(e: HandlerError) -> Self {
        Failure {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// A claimed item handed to a worker, with the agent it was bound to.
#[derive(Debug, Clone)]
pub struct Job {
    pub item: QueueItem,
    pub agent_task: Option<AgentTask>,
}

/// The external worker for one queue.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError>;
}

/// Everything a spawned job needs after the cycle that claimed it returns.
#[derive(Clone)]
struct Worker {
    queue: QueueName,
    timeout: Duration,
    store: Arc<dyn QueueStore>,
    dispatcher: Dispatcher,
    workflows: Arc<WorkflowTracker>,
    handler: Arc<dyn QueueHandler>,
    wake: Arc<Notify>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Worker {
    async fn execute(self, job: Job, _permit: OwnedSemaphorePermit) {
        let item_id = job.item.id;
        let started = Instant::now();

        let attempt = AssertUnwindSafe(self.handler.handle(&job)).catch_unwind();
        let outcome: Result<Value, Failure> = match tokio::time::timeout(self.timeout, attempt).await
        {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(panic)) => Err(Failure::transient(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(Failure::transient(format!(
                "timed out after {} ms",
                self.timeout.as_millis()
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                match self.store.complete(item_id, value.clone()).await {
                    Ok(_) => {
                        debug!(queue = %self.queue, item_id = %item_id, duration_ms, "Job succeeded");
                    }
                    Err(e) => {
                        warn!(queue = %self.queue, item_id = %item_id, error = %e, "Could not record completion");
                    }
                }
                if let Some(task) = &job.agent_task {
                    self.dispatcher.finish(task, Ok(&value));
                }
                if let Some(workflow_id) = job.item.workflow_id {
                    if let Err(e) = self.workflows.record_step_completed(workflow_id).await {
                        warn!(workflow_id = %workflow_id, error = %e, "Workflow rollup failed");
                    }
                }
            }
            Err(failure) => {
                let message = failure.message.clone();
                let fail_result = self.store.fail(item_id, failure).await;
                if let Some(task) = &job.agent_task {
                    self.dispatcher.finish(task, Err(&message));
                }
                match fail_result {
                    Ok(FailOutcome::DeadLettered(_)) => {
                        if let Some(workflow_id) = job.item.workflow_id {
                            if let Err(e) =
                                self.workflows.record_step_failed(workflow_id, &message).await
                            {
                                warn!(workflow_id = %workflow_id, error = %e, "Workflow rollup failed");
                            }
                        }
                    }
                    Ok(FailOutcome::Retrying { .. }) => {}
                    Err(e) => {
                        warn!(queue = %self.queue, item_id = %item_id, error = %e, "Could not record failure");
                    }
                }
            }
        }
        self.wake.notify_one();
    }
}

/// Runs one queue: claims due items up to its concurrency limit and executes
/// them through the queue's handler.
pub struct QueueProcessor {
    id: String,
    config: QueueConfig,
    poll_interval: Duration,
    permits: Arc<Semaphore>,
    worker: Worker,
}

impl QueueProcessor {
    /// A processor for `queue`; nothing runs until it is driven.
    pub fn new(
        queue: QueueName,
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        dispatcher: Dispatcher,
        workflows: Arc<WorkflowTracker>,
        handler: Arc<dyn QueueHandler>,
    ) -> Self {
        Self {
            id: format!("{queue}-{}", Uuid::new_v4()),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            poll_interval: Duration::from_millis(1_000),
            worker: Worker {
                queue,
                timeout: config.timeout(),
                store,
                dispatcher,
                workflows,
                handler,
                wake: Arc::new(Notify::new()),
            },
            config,
        }
    }

    /// Idle poll period, at least 1 ms.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// The queue this processor drains.
    pub fn queue(&self) -> QueueName {
        self.worker.queue
    }

    /// Identifier stamped into `claimed_by` on items this processor owns.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Ask the run loop for an immediate cycle.
    pub fn wake(&self) {
        self.worker.wake.notify_one();
    }

    /// One scheduling pass. Returns how many jobs were started.
    pub async fn run_cycle(&self) -> EvaResult<usize> {
        let queue = self.worker.queue;
        self.reclaim().await?;

        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let claimed = self.worker.store.dequeue_due(queue, free, &self.id).await?;

        let mut started = 0;
        for item in claimed {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                self.release(&item, "no free slot").await;
                continue;
            };
            let agent_task = match self.worker.dispatcher.bind(&item, &self.config) {
                Ok(task) => task,
                Err(EvaError::AgentUnavailable(reason)) => {
                    self.release(&item, &reason).await;
                    continue;
                }
                Err(e) => {
                    error!(queue = %queue, item_id = %item.id, error = %e, "Agent binding failed");
                    self.release(&item, "agent binding failed").await;
                    continue;
                }
            };
            debug!(
                queue = %queue,
                item_id = %item.id,
                agent_id = ?agent_task.as_ref().map(|t| t.agent_id),
                retry_count = item.retry_count,
                "Starting job"
            );
            let job = Job { item, agent_task };
            tokio::spawn(self.worker.clone().execute(job, permit));
            started += 1;
        }
        Ok(started)
    }

    async fn release(&self, item: &QueueItem, reason: &str) {
        warn!(queue = %self.worker.queue, item_id = %item.id, reason, "Releasing claimed item");
        if let Err(e) = self.worker.store.release(item.id).await {
            error!(queue = %self.worker.queue, item_id = %item.id, error = %e, "Could not release item");
        }
    }

    /// Run expired leases through the failure path and roll dead letters up.
    async fn reclaim(&self) -> EvaResult<()> {
        let reclaimed = self.worker.store.reclaim_expired(self.worker.queue).await?;
        for (item_id, outcome) in reclaimed {
            let FailOutcome::DeadLettered(dead) = outcome else {
                continue;
            };
            if let Some(workflow_id) = dead.workflow_id {
                let error = dead.last_error().unwrap_or(eva_queue::LEASE_EXPIRED);
                if let Err(e) = self
                    .worker
                    .workflows
                    .record_step_failed(workflow_id, error)
                    .await
                {
                    warn!(workflow_id = %workflow_id, item_id = %item_id, error = %e, "Workflow rollup failed");
                }
            }
        }
        Ok(())
    }

    /// Wait until every in-flight job has finished.
    pub async fn drain(&self) {
        let all = self.config.max_concurrency as u32;
        // Err only if the semaphore was closed, which never happens here.
        let _ = self.permits.acquire_many(all).await;
    }

    /// Loop until `shutdown` turns true, then drain in-flight jobs.
    ///
    /// Cycles run on every poll tick, on [`wake`](Self::wake), when a job
    /// finishes, and when an item is enqueued.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.worker.queue;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.worker.store.subscribe(queue);
        let mut events_open = true;

        info!(queue = %queue, processor = %self.id, max_concurrency = self.config.max_concurrency, "Queue processor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.worker.wake.notified() => {}
                event = events.recv(), if events_open => match event {
                    // Releases also publish pending updates; waking on those would spin.
                    Ok(e) if e.kind == EventKind::Insert => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(queue = %queue, error = %e, "Queue processor cycle failed");
            }
        }

        info!(queue = %queue, in_flight = self.in_flight(), "Queue processor draining");
        self.drain().await;
        info!(queue = %queue, "Queue processor stopped");
    }
}
