use crate::dispatcher::Dispatcher;
use crate::monitor::Monitor;
use crate::processor::{QueueHandler, QueueProcessor};
use crate::scheduler::{ScheduledJob, Scheduler};
use crate::workflow::WorkflowTracker;
use eva_agents::AgentRegistry;
use eva_core::{EvaResult, SharedClock, SystemClock};
use eva_queue::{QueueConfigs, QueueName, QueueStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Wires the registry, queue store and workflow tracker together and runs
/// one processor per handled queue plus the scheduler and metric loop.
pub struct Orchestrator {
    store: Arc<dyn QueueStore>,
    registry: Arc<AgentRegistry>,
    workflows: Arc<WorkflowTracker>,
    configs: QueueConfigs,
    handlers: HashMap<QueueName, Arc<dyn QueueHandler>>,
    schedules: Vec<ScheduledJob>,
    clock: SharedClock,
    poll_interval: Duration,
    snapshot_interval: Duration,
}

impl Orchestrator {
    /// An orchestrator with default settings and no handlers.
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            store,
            registry,
            workflows: Arc::new(WorkflowTracker::default()),
            configs: QueueConfigs::default(),
            handlers: HashMap::new(),
            schedules: Vec::new(),
            clock: SystemClock::shared(),
            poll_interval: Duration::from_secs(1),
            snapshot_interval: Duration::from_secs(60),
        }
    }

    /// Share an existing workflow tracker.
    pub fn with_workflows(mut self, workflows: Arc<WorkflowTracker>) -> Self {
        self.workflows = workflows;
        self
    }

    /// Per-queue settings. Must match the configs the store was built with.
    pub fn with_configs(mut self, configs: QueueConfigs) -> Self {
        self.configs = configs;
        self
    }

    /// Register the handler for a queue. Queues without a handler are not processed.
    pub fn with_handler(mut self, queue: QueueName, handler: Arc<dyn QueueHandler>) -> Self {
        self.handlers.insert(queue, handler);
        self
    }

    /// Cron jobs to run while started.
    pub fn with_schedules(mut self, schedules: Vec<ScheduledJob>) -> Self {
        self.schedules = schedules;
        self
    }

    /// Clock used by the scheduler.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// How often idle processors look for due items.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How often agent metrics are snapshotted.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// The queue store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The workflow tracker.
    pub fn workflows(&self) -> &Arc<WorkflowTracker> {
        &self.workflows
    }

    /// A monitor over this orchestrator's state.
    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.registry.clone(),
            self.store.clone(),
            self.workflows.clone(),
        )
    }

    /// Build the processor for `queue` without starting it.
    pub fn processor(&self, queue: QueueName) -> Option<QueueProcessor> {
        let handler = self.handlers.get(&queue)?.clone();
        Some(
            QueueProcessor::new(
                queue,
                self.configs.get(queue),
                self.store.clone(),
                Dispatcher::new(self.registry.clone()),
                self.workflows.clone(),
                handler,
            )
            .with_poll_interval(self.poll_interval),
        )
    }

    /// Spawn every background loop.
    ///
    /// Fails before anything is spawned when a queue config or schedule is invalid.
    pub fn start(self) -> EvaResult<OrchestratorHandle> {
        for (queue, config) in self.configs.iter() {
            config.validate(queue)?;
        }
        let scheduler = Scheduler::new(
            self.schedules.clone(),
            self.store.clone(),
            self.clock.clone(),
        )?;

        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for queue in QueueName::ALL {
            let Some(processor) = self.processor(queue) else {
                continue;
            };
            let rx = rx.clone();
            tasks.push((
                format!("processor:{queue}"),
                tokio::spawn(async move { processor.run(rx).await }),
            ));
        }
        let processors = tasks.len();
        if processors == 0 {
            warn!("No queue handlers registered; nothing will be processed");
        }

        tasks.push(("scheduler".to_string(), scheduler.start(rx.clone())));
        tasks.push((
            "metrics".to_string(),
            Monitor::spawn_snapshot_loop(self.registry.clone(), self.snapshot_interval, rx),
        ));

        info!(
            processors,
            schedules = self.schedules.iter().filter(|j| j.enabled).count(),
            "Orchestrator started"
        );
        Ok(OrchestratorHandle {
            shutdown,
            tasks,
            orchestrator: self,
        })
    }
}

/// Running orchestrator. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the background tasks running until the runtime stops.
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    orchestrator: Orchestrator,
}

impl OrchestratorHandle {
    /// The running orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop claiming new work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        info!("Orchestrator shutting down");
        // Err means every receiver is gone, i.e. the loops already exited.
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!(task = %name, error = %e, "Background task ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::processor::{HandlerError, Job};
    use async_trait::async_trait;
    use eva_queue::MemoryQueueStore;
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl QueueHandler for Echo {
        async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
            Ok(job.item.payload.clone())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryQueueStore::default()),
            Arc::new(AgentRegistry::default()),
        )
    }

    #[test]
    fn test_processor_only_for_handled_queues() {
        let orch = orchestrator().with_handler(QueueName::Notifications, Arc::new(Echo));
        assert!(orch.processor(QueueName::Notifications).is_some());
        assert!(orch.processor(QueueName::Search).is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut configs = QueueConfigs::default();
        let mut search = configs.get(QueueName::Search);
        search.max_concurrency = 0;
        configs.set(QueueName::Search, search);
        let orch = orchestrator().with_configs(configs);
        assert!(orch.start().is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_handlers() {
        let handle = orchestrator().start().unwrap();
        assert_eq!(handle.orchestrator().registry().agent_count(), 0);
        handle.shutdown().await;
    }
}
