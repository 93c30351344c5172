use crate::scoring::{Candidate, FitnessScorer};
use crate::types::{
    Agent, AgentFilter, AgentMetricSnapshot, AgentStatus, AgentTask, AgentTaskRequest,
    AgentTaskStatus, HealthStatus, NewAgent,
};
use chrono::{DateTime, Utc};
use eva_core::{EvaError, EvaResult, SharedClock, SystemClock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of [`AgentRegistry::select_and_assign`].
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    /// The execution record bound to the chosen agent.
    pub task: AgentTask,
    /// Fitness score the agent won with.
    pub score: f64,
}

/// How much finished history the registry keeps in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Finished execution records kept; the oldest are evicted first.
    pub finished_tasks: usize,
    /// Metric snapshots kept across all agents.
    pub snapshots: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            finished_tasks: 10_000,
            snapshots: 10_000,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    agents: BTreeMap<Uuid, Agent>,
    tasks: HashMap<Uuid, AgentTask>,
    /// Active record ids per agent; the load recount reads only this.
    active: HashMap<Uuid, HashSet<Uuid>>,
    /// Finished record ids in completion order, for eviction.
    finished: VecDeque<Uuid>,
    snapshots: VecDeque<AgentMetricSnapshot>,
    retention: Retention,
}

impl RegistryState {
    fn agent(&self, id: Uuid) -> EvaResult<&Agent> {
        self.agents
            .get(&id)
            .ok_or_else(|| EvaError::not_found("agent", id))
    }

    fn agent_mut(&mut self, id: Uuid) -> EvaResult<&mut Agent> {
        self.agents
            .get_mut(&id)
            .ok_or_else(|| EvaError::not_found("agent", id))
    }

    fn task(&self, id: Uuid) -> EvaResult<&AgentTask> {
        self.tasks
            .get(&id)
            .ok_or_else(|| EvaError::not_found("agent task", id))
    }

    /// Re-derive `current_tasks`, `current_load`, `status` and `success_rate`.
    fn recompute(&mut self, agent_id: Uuid) -> EvaResult<&Agent> {
        let active = self.active.get(&agent_id).map_or(0, HashSet::len) as u32;

        let agent = self.agent_mut(agent_id)?;
        agent.current_tasks = active;
        agent.current_load = Agent::load_for(active, agent.max_concurrent_tasks);
        if agent.status != AgentStatus::Offline {
            agent.status = AgentStatus::from_load(agent.current_load);
        }
        agent.success_rate = agent.derive_success_rate();
        Ok(&*agent)
    }

    /// Every AgentTask insert or update goes through here, so the owning
    /// agent's load is recomputed inside the same critical section.
    fn apply_task_change(&mut self, task: AgentTask) -> EvaResult<AgentTask> {
        self.agent(task.agent_id)?;
        let agent_id = task.agent_id;
        if task.status.is_active() {
            self.active.entry(agent_id).or_default().insert(task.id);
        } else {
            if let Some(ids) = self.active.get_mut(&agent_id) {
                ids.remove(&task.id);
            }
            self.finished.push_back(task.id);
        }
        self.tasks.insert(task.id, task.clone());
        self.recompute(agent_id)?;
        self.evict_finished();
        Ok(task)
    }

    fn evict_finished(&mut self) {
        while self.finished.len() > self.retention.finished_tasks {
            if let Some(id) = self.finished.pop_front() {
                self.tasks.remove(&id);
            }
        }
    }

    /// Rebuild the active index from the retained records.
    fn rebuild_active(&mut self) {
        self.active.clear();
        for task in self.tasks.values().filter(|t| t.status.is_active()) {
            self.active.entry(task.agent_id).or_default().insert(task.id);
        }
    }

    fn push_snapshots(&mut self, taken: &[AgentMetricSnapshot]) {
        self.snapshots.extend(taken.iter().cloned());
        let excess = self.snapshots.len().saturating_sub(self.retention.snapshots);
        self.snapshots.drain(..excess);
    }

    fn assign(
        &mut self,
        agent_id: Uuid,
        request: AgentTaskRequest,
        now: DateTime<Utc>,
    ) -> EvaResult<AgentTask> {
        let agent = self.agent(agent_id)?;
        if !agent.is_schedulable() {
            return Err(EvaError::AgentUnavailable(format!(
                "agent {} is {} at {:.0}% load",
                agent.name, agent.status, agent.current_load
            )));
        }
        self.apply_task_change(AgentTask::assigned(agent_id, request, now))
    }
}

/// Holds agent capacity, load, capability and health state.
///
/// Agents and their execution records share one lock: an AgentTask write and
/// the load recompute it triggers are never observed separately. Finished
/// records and metric snapshots are bounded by [`Retention`]; active records
/// are never evicted.
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    scorer: FitnessScorer,
    clock: SharedClock,
}

impl AgentRegistry {
    /// Create a registry that ranks candidates with `scorer`.
    pub fn new(scorer: FitnessScorer, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            scorer,
            clock,
        }
    }

    /// Replace the history limits. Applies from the next write.
    pub fn with_retention(self, retention: Retention) -> Self {
        self.state.lock().retention = retention;
        self
    }

    /// The scorer used for ranking and selection.
    pub fn scorer(&self) -> &FitnessScorer {
        &self.scorer
    }

    /// Register a new agent with zero load.
    pub fn register(&self, new_agent: NewAgent) -> EvaResult<Agent> {
        new_agent.validate()?;
        let agent = new_agent.into_agent(self.clock.now());
        let mut state = self.state.lock();
        if state.agents.contains_key(&agent.id) {
            return Err(EvaError::Validation(format!(
                "agent {} is already registered",
                agent.id
            )));
        }
        info!(agent_id = %agent.id, name = %agent.name, agent_type = %agent.agent_type, "Agent registered");
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    /// One agent by id.
    pub fn get(&self, agent_id: Uuid) -> EvaResult<Agent> {
        self.state.lock().agent(agent_id).cloned()
    }

    /// Agents matching `filter`, least loaded first.
    pub fn list(&self, filter: &AgentFilter) -> Vec<Agent> {
        let state = self.state.lock();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| {
            a.current_load
                .total_cmp(&b.current_load)
                .then_with(|| a.id.cmp(&b.id))
        });
        agents
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.state.lock().agents.len()
    }

    /// Recount the agent's active tasks and re-derive load and status.
    pub fn recompute_load(&self, agent_id: Uuid) -> EvaResult<Agent> {
        let mut state = self.state.lock();
        state.recompute(agent_id).cloned()
    }

    /// Rebuild the active index and recompute every agent. Returns how many
    /// agents had drifted.
    pub fn reconcile(&self) -> usize {
        let mut state = self.state.lock();
        state.rebuild_active();
        let ids: Vec<Uuid> = state.agents.keys().copied().collect();
        let mut drifted = 0;
        for id in ids {
            let before = state.agents.get(&id).map(|a| (a.current_tasks, a.status));
            if let Ok(after) = state.recompute(id) {
                if before != Some((after.current_tasks, after.status)) {
                    warn!(agent_id = %id, current_tasks = after.current_tasks, "Reconciled drifted agent load");
                    drifted += 1;
                }
            }
        }
        drifted
    }

    /// Record the outcome of an external health check.
    pub fn set_health(&self, agent_id: Uuid, health: HealthStatus) -> EvaResult<Agent> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        if agent.health_status != health {
            info!(agent_id = %agent_id, from = %agent.health_status, to = %health, "Agent health changed");
        }
        agent.health_status = health;
        agent.last_health_check = Some(now);
        Ok(agent.clone())
    }

    /// Take the agent out of scheduling. Existing tasks keep running.
    pub fn deactivate(&self, agent_id: Uuid) -> EvaResult<Agent> {
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.status = AgentStatus::Offline;
        info!(agent_id = %agent_id, "Agent deactivated");
        Ok(agent.clone())
    }

    /// Clear the offline flag and re-derive status from load.
    pub fn reactivate(&self, agent_id: Uuid) -> EvaResult<Agent> {
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.status = AgentStatus::from_load(agent.current_load);
        info!(agent_id = %agent_id, status = %agent.status, "Agent reactivated");
        Ok(agent.clone())
    }

    /// Score one agent; the diagnostics boundary of the scorer.
    pub fn score(
        &self,
        agent_id: Uuid,
        task_type: &str,
        required_capabilities: &[String],
    ) -> EvaResult<f64> {
        let state = self.state.lock();
        let agent = state.agent(agent_id)?;
        Ok(self.scorer.score(agent, task_type, required_capabilities))
    }

    /// Eligible agents for a task, best first.
    pub fn rank(&self, task_type: &str, required_capabilities: &[String]) -> Vec<Candidate> {
        let state = self.state.lock();
        self.scorer
            .rank(state.agents.values(), task_type, required_capabilities)
    }

    /// Bind work to a specific agent.
    pub fn assign(&self, agent_id: Uuid, request: AgentTaskRequest) -> EvaResult<AgentTask> {
        let now = self.clock.now();
        let task = self.state.lock().assign(agent_id, request, now)?;
        debug!(agent_id = %agent_id, task_id = %task.task_id, "Task assigned");
        Ok(task)
    }

    /// Pick the best agent and bind the work to it in one step.
    pub fn select_and_assign(
        &self,
        request: AgentTaskRequest,
        required_capabilities: &[String],
    ) -> EvaResult<Assignment> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let best = self
            .scorer
            .select(state.agents.values(), &request.task_type, required_capabilities)
            .ok_or_else(|| {
                EvaError::AgentUnavailable(format!(
                    "no eligible agent for task type '{}'",
                    request.task_type
                ))
            })?;
        let task = state.assign(best.agent_id, request, now)?;
        debug!(
            agent_id = %best.agent_id,
            task_id = %task.task_id,
            score = best.score,
            "Task assigned to best-scoring agent"
        );
        Ok(Assignment {
            task,
            score: best.score,
        })
    }

    /// One execution record. Evicted finished records are not found.
    pub fn task(&self, record_id: Uuid) -> EvaResult<AgentTask> {
        self.state.lock().task(record_id).cloned()
    }

    /// Retained execution records of one agent, oldest first.
    pub fn tasks_for(&self, agent_id: Uuid) -> Vec<AgentTask> {
        let state = self.state.lock();
        let mut tasks: Vec<AgentTask> = state
            .tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.assigned_at);
        tasks
    }

    /// Assigned -> in progress.
    pub fn start_task(&self, record_id: Uuid) -> EvaResult<AgentTask> {
        self.transition(record_id, AgentTaskStatus::InProgress, None, None)
    }

    /// Finish successfully.
    pub fn complete_task(
        &self,
        record_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> EvaResult<AgentTask> {
        self.transition(record_id, AgentTaskStatus::Completed, result, None)
    }

    /// Finish with an error.
    pub fn fail_task(&self, record_id: Uuid, error: impl Into<String>) -> EvaResult<AgentTask> {
        self.transition(record_id, AgentTaskStatus::Failed, None, Some(error.into()))
    }

    /// Give the capacity back without counting an outcome.
    pub fn cancel_task(&self, record_id: Uuid) -> EvaResult<AgentTask> {
        self.transition(record_id, AgentTaskStatus::Cancelled, None, None)
    }

    fn transition(
        &self,
        record_id: Uuid,
        to: AgentTaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> EvaResult<AgentTask> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut task = state.task(record_id)?.clone();

        let allowed = match (task.status, to) {
            (AgentTaskStatus::Assigned, AgentTaskStatus::InProgress) => true,
            (from, to) if from.is_active() && to.is_terminal() => true,
            _ => false,
        };
        if !allowed {
            return Err(EvaError::invalid_transition(
                "agent task",
                record_id,
                task.status,
                to,
            ));
        }

        task.status = to;
        match to {
            AgentTaskStatus::InProgress => task.started_at = Some(now),
            _ => {
                task.actual_duration_ms = Some(task.elapsed_ms(now));
                task.finished_at = Some(now);
                task.result = result;
                task.error = error;
            }
        }

        let agent = state.agent_mut(task.agent_id)?;
        match to {
            AgentTaskStatus::Completed => agent.completed_tasks += 1,
            AgentTaskStatus::Failed => agent.failed_tasks += 1,
            _ => {}
        }
        if to != AgentTaskStatus::Cancelled {
            agent.last_active_at = Some(now);
        }

        state.apply_task_change(task)
    }

    /// Append one snapshot per agent to the bounded metric history.
    pub fn snapshot_metrics(&self) -> Vec<AgentMetricSnapshot> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let taken: Vec<AgentMetricSnapshot> = state
            .agents
            .values()
            .map(|a| AgentMetricSnapshot::of(a, now))
            .collect();
        state.push_snapshots(&taken);
        taken
    }

    /// Snapshot history of one agent, oldest first.
    pub fn metric_history(&self, agent_id: Uuid) -> Vec<AgentMetricSnapshot> {
        self.state
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(FitnessScorer::default(), SystemClock::shared())
    }
}
