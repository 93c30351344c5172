#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use eva_agents::{AgentRegistry, NewAgent};
use eva_core::{EvaError, ManualClock};
use eva_orchestrator::*;
use eva_queue::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Helper: jitter-free queue settings.
fn configs() -> QueueConfigs {
    let mut configs = QueueConfigs::default();
    for queue in QueueName::ALL {
        let mut cfg = configs.get(queue);
        cfg.backoff.jitter = 0.0;
        configs.set(queue, cfg);
    }
    configs
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<dyn QueueStore>,
    registry: Arc<AgentRegistry>,
    workflows: Arc<WorkflowTracker>,
    configs: QueueConfigs,
}

impl Harness {
    fn new(configs: QueueConfigs) -> Self {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn QueueStore> =
            Arc::new(MemoryQueueStore::new(configs.clone(), clock.clone()));
        Self {
            store,
            registry: Arc::new(AgentRegistry::new(Default::default(), clock.clone())),
            workflows: Arc::new(WorkflowTracker::new(clock.clone())),
            clock,
            configs,
        }
    }

    /// Helper: a processor for `queue` running `handler`.
    fn processor(&self, queue: QueueName, handler: Arc<dyn QueueHandler>) -> QueueProcessor {
        QueueProcessor::new(
            queue,
            self.configs.get(queue),
            self.store.clone(),
            Dispatcher::new(self.registry.clone()),
            self.workflows.clone(),
            handler,
        )
    }

    /// Helper: one cycle, then wait for every job it started.
    async fn cycle(&self, processor: &QueueProcessor) -> usize {
        let started = processor.run_cycle().await.unwrap();
        processor.drain().await;
        started
    }
}

struct Echo;

#[async_trait]
impl QueueHandler for Echo {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        Ok(json!({"echo": job.item.payload}))
    }
}

/// Fails transiently for the first `failures` attempts.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl QueueHandler for Flaky {
    async fn handle(&self, _job: &Job) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::transient("rate limited"))
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

struct Rejects;

#[async_trait]
impl QueueHandler for Rejects {
    async fn handle(&self, _job: &Job) -> Result<Value, HandlerError> {
        Err(HandlerError::permanent("malformed resume"))
    }
}

struct Slow;

#[async_trait]
impl QueueHandler for Slow {
    async fn handle(&self, _job: &Job) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Workflow rollup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_workflow_completes_after_all_steps() {
    let h = Harness::new(configs());
    let workflow = h
        .workflows
        .start_with_steps("weekly digest", None, Map::new(), 2)
        .await
        .unwrap();
    for n in 0..2 {
        h.store
            .enqueue(
                QueueName::Notifications,
                json!({"n": n}),
                EnqueueOptions::default().workflow(workflow.id),
            )
            .await
            .unwrap();
    }

    let processor = h.processor(QueueName::Notifications, Arc::new(Echo));
    assert_eq!(h.cycle(&processor).await, 2);

    let done = h.workflows.get(workflow.id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.completed_steps, 2);
    assert!(done.completed_at.is_some());

    let err = h
        .workflows
        .update(workflow.id, WorkflowUpdate::failed("too late"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());

    let completed = h
        .store
        .list(QueueName::Notifications, Some(QueueStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);
    assert!(completed.iter().all(|i| i.result.is_some()));
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_and_fails_workflow() {
    let h = Harness::new(configs());
    let agent = h
        .registry
        .register(
            NewAgent::new("parser", "resume_parsing").with_capabilities(["document_parsing"]),
        )
        .unwrap();
    let workflow = h
        .workflows
        .start("import resumes", Some(agent.id), Map::new())
        .await;
    let item = h
        .store
        .enqueue(
            QueueName::ResumeParsing,
            json!({"file": "cv.pdf"}),
            EnqueueOptions::default().workflow(workflow.id),
        )
        .await
        .unwrap();

    let processor = h.processor(QueueName::ResumeParsing, Arc::new(Rejects));
    assert_eq!(h.cycle(&processor).await, 1);

    let failed = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.retry_count, 0);

    let dead = h
        .store
        .dead_letters(Some(QueueName::ResumeParsing))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_item_id, item.id);
    assert_eq!(dead[0].last_error(), Some("malformed resume"));

    let wf = h.workflows.get(workflow.id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert!(wf.error_message.unwrap().contains("malformed resume"));

    let agent = h.registry.get(agent.id).unwrap();
    assert_eq!(agent.current_tasks, 0);
    assert_eq!(agent.failed_tasks, 1);
    assert_eq!(agent.success_rate, 0.0);
}

// ---------------------------------------------------------------------------
// Retries, timeouts, agent bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failure_retries_after_backoff() {
    let h = Harness::new(configs());
    let item = h
        .store
        .enqueue(QueueName::CrmSync, json!({"contact": 7}), EnqueueOptions::default())
        .await
        .unwrap();
    let handler = Arc::new(Flaky {
        failures: 1,
        calls: AtomicU32::new(0),
    });
    let processor = h.processor(QueueName::CrmSync, handler.clone());

    assert_eq!(h.cycle(&processor).await, 1);
    let retrying = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(retrying.status, QueueStatus::Pending);
    assert_eq!(retrying.retry_count, 1);
    assert_eq!(retrying.error.as_deref(), Some("rate limited"));

    // Backoff of the first retry is one second.
    assert_eq!(h.cycle(&processor).await, 0);
    h.clock.advance(ChronoDuration::milliseconds(1_000));
    assert_eq!(h.cycle(&processor).await, 1);

    let done = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.result, Some(json!({"ok": true})));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_handler_timeout_counts_as_transient_failure() {
    let mut configs = configs();
    let mut cfg = configs.get(QueueName::Notifications);
    cfg.timeout_ms = 50;
    configs.set(QueueName::Notifications, cfg);
    let h = Harness::new(configs);
    let item = h
        .store
        .enqueue(QueueName::Notifications, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let processor = h.processor(QueueName::Notifications, Arc::new(Slow));
    assert_eq!(h.cycle(&processor).await, 1);

    let item = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.error.as_deref(), Some("timed out after 50 ms"));
}

#[tokio::test]
async fn test_offline_agents_leave_items_pending() {
    let h = Harness::new(configs());
    let agent = h
        .registry
        .register(NewAgent::new("writer", "content_generation").with_capabilities(["llm"]))
        .unwrap();
    h.registry.deactivate(agent.id).unwrap();
    let item = h
        .store
        .enqueue(QueueName::ContentGeneration, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let processor = h.processor(QueueName::ContentGeneration, Arc::new(Echo));
    assert_eq!(h.cycle(&processor).await, 0);
    let item = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 0);

    h.registry.reactivate(agent.id).unwrap();
    assert_eq!(h.cycle(&processor).await, 1);
    let agent = h.registry.get(agent.id).unwrap();
    assert_eq!(agent.completed_tasks, 1);
    assert_eq!(agent.current_tasks, 0);
}

// ---------------------------------------------------------------------------
// Orchestrator lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orchestrator_processes_and_shuts_down() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new(
        configs(),
        eva_core::SystemClock::shared(),
    ));
    let registry = Arc::new(AgentRegistry::default());
    let agents: Vec<_> = (0..2)
        .map(|n| {
            registry
                .register(
                    NewAgent::new(format!("searcher-{n}"), "search")
                        .with_capabilities(["web_search"])
                        .with_max_concurrent(2),
                )
                .unwrap()
        })
        .collect();

    let handle = Orchestrator::new(store.clone(), registry.clone())
        .with_configs(configs())
        .with_handler(QueueName::Search, Arc::new(Echo))
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .unwrap();

    for n in 0..12 {
        store
            .enqueue(QueueName::Search, json!({"q": n}), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let done = store
            .list(QueueName::Search, Some(QueueStatus::Completed))
            .await
            .unwrap();
        if done.len() == 12 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "only {} done", done.len());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snapshot = handle.orchestrator().monitor().snapshot().await.unwrap();
    assert_eq!(snapshot.aggregate.pending_items, 0);
    assert_eq!(snapshot.aggregate.processing_items, 0);
    handle.shutdown().await;

    let finished: u64 = agents
        .iter()
        .map(|a| {
            let a = registry.get(a.id).unwrap();
            assert_eq!(a.current_tasks, 0);
            a.completed_tasks
        })
        .sum();
    assert_eq!(finished, 12);
}

#[tokio::test]
async fn test_invalid_schedule_prevents_start() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::default());
    let res = Orchestrator::new(store, Arc::new(AgentRegistry::default()))
        .with_schedules(vec![ScheduledJob {
            name: "nightly".into(),
            cron_expression: "whenever".into(),
            queue: QueueName::CrmSync,
            payload: Value::Null,
            priority: 5,
            enabled: true,
        }])
        .start();
    assert!(matches!(res, Err(EvaError::Config(_))));
}

#[tokio::test]
async fn test_processor_over_sqlite_store() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let store: Arc<dyn QueueStore> = Arc::new(
        SqliteQueueStore::open(tmp.path().join("queue.db"), configs(), clock.clone()).unwrap(),
    );
    let workflows = Arc::new(WorkflowTracker::new(clock.clone()));
    let workflow = workflows
        .start_with_steps("sync", None, Map::new(), 3)
        .await
        .unwrap();
    for n in 0..3 {
        store
            .enqueue(
                QueueName::CrmSync,
                json!({"page": n}),
                EnqueueOptions::default().workflow(workflow.id),
            )
            .await
            .unwrap();
    }

    let processor = QueueProcessor::new(
        QueueName::CrmSync,
        configs().get(QueueName::CrmSync),
        store.clone(),
        Dispatcher::new(Arc::new(AgentRegistry::default())),
        workflows.clone(),
        Arc::new(Echo),
    );
    // crm_sync runs two at a time.
    assert_eq!(processor.run_cycle().await.unwrap(), 2);
    processor.drain().await;
    assert_eq!(
        workflows.get(workflow.id).await.unwrap().status,
        WorkflowStatus::Active
    );
    assert_eq!(processor.run_cycle().await.unwrap(), 1);
    processor.drain().await;

    let wf = workflows.get(workflow.id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    let health = store.health(QueueName::CrmSync).await.unwrap();
    assert_eq!(health.completed_items, 3);
    assert_eq!(health.success_rate, 100.0);
}
