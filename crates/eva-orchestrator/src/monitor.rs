use crate::workflow::{Workflow, WorkflowTracker};
use chrono::{DateTime, Utc};
use eva_agents::{Agent, AgentFilter, AgentRegistry, AgentStatus};
use eva_core::EvaResult;
use eva_queue::{QueueHealth, QueueName, QueueStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Totals across every agent and queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub agents: usize,
    pub agents_available: usize,
    pub agents_offline: usize,
    /// Sum of `max_concurrent_tasks` over agents that are not offline.
    pub capacity: u64,
    pub active_tasks: u64,
    pub pending_items: usize,
    pub processing_items: usize,
    pub dead_letter_items: usize,
}

/// Everything the dashboard renders in one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub taken_at: DateTime<Utc>,
    pub agents: Vec<Agent>,
    pub queues: Vec<QueueHealth>,
    pub workflows: Vec<Workflow>,
    pub aggregate: AggregateMetrics,
}

/// Read-only view over the registry, queues and workflows.
pub struct Monitor {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn QueueStore>,
    workflows: Arc<WorkflowTracker>,
}

impl Monitor {
    /// A monitor reading from the given components.
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn QueueStore>,
        workflows: Arc<WorkflowTracker>,
    ) -> Self {
        Self {
            registry,
            store,
            workflows,
        }
    }

    /// Health of every known queue.
    pub async fn queue_health(&self) -> EvaResult<Vec<QueueHealth>> {
        let mut all = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            all.push(self.store.health(queue).await?);
        }
        Ok(all)
    }

    /// Point-in-time view of agents, queues and workflows.
    pub async fn snapshot(&self) -> EvaResult<DashboardSnapshot> {
        let agents = self.registry.list(&AgentFilter::default());
        let queues = self.queue_health().await?;
        let workflows = self.workflows.list(None).await;

        let mut aggregate = AggregateMetrics {
            agents: agents.len(),
            ..AggregateMetrics::default()
        };
        for agent in &agents {
            match agent.status {
                AgentStatus::Offline => aggregate.agents_offline += 1,
                AgentStatus::Available => aggregate.agents_available += 1,
                AgentStatus::Busy | AgentStatus::Overloaded => {}
            }
            if agent.status != AgentStatus::Offline {
                aggregate.capacity += u64::from(agent.max_concurrent_tasks);
            }
            aggregate.active_tasks += u64::from(agent.current_tasks);
        }
        for health in &queues {
            aggregate.pending_items += health.pending_items;
            aggregate.processing_items += health.processing_items;
            aggregate.dead_letter_items += health.dead_letter_items;
        }

        Ok(DashboardSnapshot {
            taken_at: Utc::now(),
            agents,
            queues,
            workflows,
            aggregate,
        })
    }

    /// Serialize the current state as JSON (for the dashboard).
    pub async fn to_json(&self) -> EvaResult<serde_json::Value> {
        Ok(serde_json::to_value(self.snapshot().await?)?)
    }

    /// Periodically append agent metric snapshots and repair drifted load.
    pub fn spawn_snapshot_loop(
        registry: Arc<AgentRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup stays quiet.
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "Metric snapshot loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let repaired = registry.reconcile();
                let taken = registry.snapshot_metrics();
                debug!(snapshots = taken.len(), repaired, "Agent metrics snapshotted");
            }
            info!("Metric snapshot loop stopped");
        })
    }
}
