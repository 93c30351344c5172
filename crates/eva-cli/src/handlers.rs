use async_trait::async_trait;
use eva_orchestrator::{HandlerError, Job, QueueHandler};
use serde_json::{json, Value};
use tracing::info;

/// Stand-in worker for `eva run`: logs the job and echoes its payload.
pub struct EchoHandler;

#[async_trait]
impl QueueHandler for EchoHandler {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let agent_id = job.agent_task.as_ref().map(|t| t.agent_id);
        info!(
            queue = %job.item.queue_name,
            item_id = %job.item.id,
            agent_id = ?agent_id,
            retry_count = job.item.retry_count,
            "Echo handler processing item"
        );
        Ok(json!({
            "echo": job.item.payload,
            "agent_id": agent_id,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eva_queue::{EnqueueOptions, MemoryQueueStore, QueueName, QueueStore};

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let store = MemoryQueueStore::default();
        store
            .enqueue(QueueName::Notifications, json!({"to": "ana"}), EnqueueOptions::default())
            .await
            .unwrap();
        let item = store
            .dequeue_due(QueueName::Notifications, 1, "test")
            .await
            .unwrap()
            .remove(0);

        let out = EchoHandler
            .handle(&Job {
                item,
                agent_task: None,
            })
            .await
            .unwrap();
        assert_eq!(out["echo"]["to"], "ana");
        assert!(out["agent_id"].is_null());
    }
}
