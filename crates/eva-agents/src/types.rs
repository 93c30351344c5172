use chrono::{DateTime, Duration, Utc};
use eva_core::{EvaError, EvaResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Load percentage at or above which an agent counts as overloaded.
pub const OVERLOAD_THRESHOLD: f64 = 90.0;

/// Scheduling status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// No active tasks.
    Available,
    /// Running at least one task, below the overload threshold.
    Busy,
    /// Deactivated by an operator. Sticky until reactivated.
    Offline,
    /// Load at or above [`OVERLOAD_THRESHOLD`].
    Overloaded,
}

impl AgentStatus {
    /// Status implied by a load percentage (never [`AgentStatus::Offline`]).
    pub fn from_load(load: f64) -> Self {
        if load >= OVERLOAD_THRESHOLD {
            AgentStatus::Overloaded
        } else if load > 0.0 {
            AgentStatus::Busy
        } else {
            AgentStatus::Available
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Overloaded => write!(f, "overloaded"),
        }
    }
}

/// Health as asserted by external health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    /// Passing health checks.
    Healthy,
    /// Responding, but slow or partially failing.
    Degraded,
    /// Failing health checks.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A worker entity with finite concurrent capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    pub max_concurrent_tasks: u32,
    pub current_tasks: u32,
    /// Derived from `current_tasks`; see [`Agent::load_for`].
    pub current_load: f64,
    pub success_rate: f64,
    pub capabilities: BTreeSet<String>,
    pub specializations: BTreeSet<String>,
    pub priority: u8,
    pub health_status: HealthStatus,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Agent {
    /// `min(100, tasks * 100 / max)`.
    pub fn load_for(current_tasks: u32, max_concurrent_tasks: u32) -> f64 {
        let max = max_concurrent_tasks.max(1) as f64;
        (current_tasks as f64 * 100.0 / max).min(100.0)
    }

    /// Free capacity as a percentage.
    pub fn free_capacity(&self) -> f64 {
        100.0 - self.current_load
    }

    /// Whether the scheduler may hand this agent another task.
    pub fn is_schedulable(&self) -> bool {
        self.status != AgentStatus::Offline && self.current_load < 100.0
    }

    /// Success ratio of finished tasks, 100 when nothing has finished yet.
    pub(crate) fn derive_success_rate(&self) -> f64 {
        let finished = self.completed_tasks + self.failed_tasks;
        if finished == 0 {
            100.0
        } else {
            self.completed_tasks as f64 * 100.0 / finished as f64
        }
    }
}

/// Registration input for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    /// Fixed id; a random one is generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_agent_type() -> String {
    "general".to_string()
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_priority() -> u8 {
    5
}

impl NewAgent {
    /// Start a registration with default capacity and priority.
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            agent_type: agent_type.into(),
            max_concurrent_tasks: default_max_concurrent(),
            capabilities: BTreeSet::new(),
            specializations: BTreeSet::new(),
            priority: default_priority(),
        }
    }

    /// Use a fixed id, e.g. one persisted elsewhere.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the concurrent task capacity.
    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the scheduling priority (1-10).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Add specializations matched against task types.
    pub fn with_specializations<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specializations = specs.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn validate(&self) -> EvaResult<()> {
        if self.name.trim().is_empty() {
            return Err(EvaError::Validation("agent name must not be empty".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(EvaError::Validation(format!(
                "agent '{}': max_concurrent_tasks must be at least 1",
                self.name
            )));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(EvaError::Validation(format!(
                "agent '{}': priority must be between 1 and 10, got {}",
                self.name, self.priority
            )));
        }
        Ok(())
    }

    pub(crate) fn into_agent(self, now: DateTime<Utc>) -> Agent {
        Agent {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            agent_type: self.agent_type,
            status: AgentStatus::Available,
            max_concurrent_tasks: self.max_concurrent_tasks,
            current_tasks: 0,
            current_load: 0.0,
            success_rate: 100.0,
            capabilities: self.capabilities,
            specializations: self.specializations,
            priority: self.priority,
            health_status: HealthStatus::Healthy,
            completed_tasks: 0,
            failed_tasks: 0,
            created_at: now,
            last_active_at: None,
            last_health_check: None,
        }
    }
}

/// Status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl AgentTaskStatus {
    /// Assigned and in-progress records occupy agent capacity.
    pub fn is_active(self) -> bool {
        matches!(self, AgentTaskStatus::Assigned | AgentTaskStatus::InProgress)
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for AgentTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentTaskStatus::Assigned => write!(f, "assigned"),
            AgentTaskStatus::InProgress => write!(f, "in_progress"),
            AgentTaskStatus::Completed => write!(f, "completed"),
            AgentTaskStatus::Failed => write!(f, "failed"),
            AgentTaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Input for binding a unit of work to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRequest {
    /// Queue item id or any caller-chosen id for directly scheduled work.
    pub task_id: Uuid,
    pub task_type: String,
    /// Normalised priority, 0.0–1.0.
    pub priority: f64,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl AgentTaskRequest {
    /// A request for `task_type` work identified by `task_id`.
    pub fn new(task_id: Uuid, task_type: impl Into<String>) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            priority: 0.5,
            estimated_duration_ms: None,
        }
    }

    /// Map a 1–10 queue priority onto the 0–1 range.
    pub fn with_queue_priority(mut self, priority: u8) -> Self {
        self.priority = (priority.clamp(1, 10) as f64) / 10.0;
        self
    }

    /// Attach an expected duration.
    pub fn with_estimate(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }
}

/// The binding of a unit of work to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Uuid,
    pub task_type: String,
    pub priority: f64,
    pub status: AgentTaskStatus,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_usage: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl AgentTask {
    pub(crate) fn assigned(agent_id: Uuid, request: AgentTaskRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_id: request.task_id,
            task_type: request.task_type,
            priority: request.priority.clamp(0.0, 1.0),
            status: AgentTaskStatus::Assigned,
            estimated_duration_ms: request.estimated_duration_ms,
            actual_duration_ms: None,
            assigned_at: now,
            started_at: None,
            finished_at: None,
            resource_usage: serde_json::Value::Null,
            result: None,
            error: None,
        }
    }

    pub(crate) fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let from = self.started_at.unwrap_or(self.assigned_at);
        (now - from).max(Duration::zero()).num_milliseconds() as u64
    }
}

/// Point-in-time record of an agent's load and performance. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetricSnapshot {
    pub agent_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub health_status: HealthStatus,
    pub current_tasks: u32,
    pub current_load: f64,
    pub success_rate: f64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

impl AgentMetricSnapshot {
    pub(crate) fn of(agent: &Agent, taken_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent.id,
            taken_at,
            status: agent.status,
            health_status: agent.health_status,
            current_tasks: agent.current_tasks,
            current_load: agent.current_load,
            success_rate: agent.success_rate,
            completed_tasks: agent.completed_tasks,
            failed_tasks: agent.failed_tasks,
        }
    }
}

/// Filter for [`crate::AgentRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub agent_type: Option<String>,
}

impl AgentFilter {
    /// Only agents in this status.
    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only agents of this type.
    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub(crate) fn matches(&self, agent: &Agent) -> bool {
        self.status.map_or(true, |s| agent.status == s)
            && self
                .agent_type
                .as_deref()
                .map_or(true, |t| agent.agent_type == t)
    }
}
