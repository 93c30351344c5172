use eva_agents::{AgentRegistry, AgentTask, AgentTaskRequest};
use eva_core::EvaResult;
use eva_queue::{QueueConfig, QueueItem};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Binds claimed queue items to agents and reports outcomes back to the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
}

impl Dispatcher {
    /// A dispatcher binding work through `registry`.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// The registry agents are selected from.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Pick and occupy an agent for `item` when its queue asks for affinity.
    ///
    /// `Ok(None)` means the queue runs without an agent. `AgentUnavailable`
    /// means nobody can take it right now.
    pub fn bind(&self, item: &QueueItem, config: &QueueConfig) -> EvaResult<Option<AgentTask>> {
        if !config.agent_affinity {
            return Ok(None);
        }
        let request = AgentTaskRequest::new(item.id, item.queue_name.as_str())
            .with_queue_priority(item.priority)
            .with_estimate(config.timeout_ms);
        let assignment = self
            .registry
            .select_and_assign(request, &config.required_capabilities)?;
        let task = match self.registry.start_task(assignment.task.id) {
            Ok(task) => task,
            Err(e) => {
                self.abandon(&assignment.task);
                return Err(e);
            }
        };
        debug!(
            queue = %item.queue_name,
            item_id = %item.id,
            agent_id = %task.agent_id,
            score = assignment.score,
            "Queue item bound to agent"
        );
        Ok(Some(task))
    }

    /// Record the handler outcome on the agent's execution record.
    ///
    /// Registry errors here are logged and swallowed: the queue outcome is
    /// already durable and must not be undone by bookkeeping.
    pub fn finish(&self, task: &AgentTask, outcome: Result<&Value, &str>) {
        let res = match outcome {
            Ok(result) => self.registry.complete_task(task.id, Some(result.clone())),
            Err(error) => self.registry.fail_task(task.id, error),
        };
        if let Err(e) = res {
            warn!(agent_id = %task.agent_id, record_id = %task.id, error = %e, "Failed to record agent task outcome");
        }
    }

    /// Hand the capacity back without counting an outcome.
    pub fn abandon(&self, task: &AgentTask) {
        if let Err(e) = self.registry.cancel_task(task.id) {
            warn!(agent_id = %task.agent_id, record_id = %task.id, error = %e, "Failed to cancel agent task");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eva_agents::{AgentTaskStatus, NewAgent};
    use eva_core::EvaError;
    use eva_queue::{EnqueueOptions, MemoryQueueStore, QueueName, QueueStore};
    use serde_json::json;

    async fn claimed(queue: QueueName) -> QueueItem {
        let store = MemoryQueueStore::default();
        store
            .enqueue(queue, json!({}), EnqueueOptions::default().priority(8))
            .await
            .unwrap();
        store.dequeue_due(queue, 1, "t").await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_no_affinity_needs_no_agent() {
        let dispatcher = Dispatcher::new(Arc::new(AgentRegistry::default()));
        let item = claimed(QueueName::Notifications).await;
        let config = QueueConfig::for_queue(QueueName::Notifications);
        assert!(dispatcher.bind(&item, &config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_occupies_agent_until_finished() {
        let registry = Arc::new(AgentRegistry::default());
        let agent = registry
            .register(NewAgent::new("searcher", "search").with_max_concurrent(2))
            .unwrap();
        let dispatcher = Dispatcher::new(registry.clone());
        let item = claimed(QueueName::Search).await;

        let task = dispatcher
            .bind(&item, &QueueConfig::for_queue(QueueName::Search))
            .unwrap()
            .unwrap();
        assert_eq!(task.status, AgentTaskStatus::InProgress);
        assert_eq!(task.task_id, item.id);
        assert_eq!(task.priority, 0.8);
        assert_eq!(registry.get(agent.id).unwrap().current_tasks, 1);

        dispatcher.finish(&task, Ok(&json!({"hits": 3})));
        let agent = registry.get(agent.id).unwrap();
        assert_eq!(agent.current_tasks, 0);
        assert_eq!(agent.completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_no_agents_is_unavailable() {
        let dispatcher = Dispatcher::new(Arc::new(AgentRegistry::default()));
        let item = claimed(QueueName::Search).await;
        let err = dispatcher
            .bind(&item, &QueueConfig::for_queue(QueueName::Search))
            .unwrap_err();
        assert!(matches!(err, EvaError::AgentUnavailable(_)));
    }
}
