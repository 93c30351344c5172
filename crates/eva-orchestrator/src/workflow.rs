use chrono::{DateTime, Utc};
use eva_core::{EvaError, EvaResult, SharedClock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Message recorded on workflows cancelled by an operator.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

/// Rollup status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            WorkflowStatus::Pending => 0,
            WorkflowStatus::Active => 1,
            WorkflowStatus::Completed | WorkflowStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A user-visible aggregate of one or more task executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    /// Agent primarily responsible, if any.
    pub agent_id: Option<Uuid>,
    pub status: WorkflowStatus,
    /// 0–100, never decreasing.
    pub progress: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub error_message: Option<String>,
    /// Number of constituent steps when known up front.
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub completed_steps: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update merged by [`WorkflowTracker::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowUpdate {
    pub status: Option<WorkflowStatus>,
    pub progress: Option<f64>,
    pub error_message: Option<String>,
}

impl WorkflowUpdate {
    /// Only a status change.
    pub fn status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Only a progress report.
    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// `status = failed` with the mandatory message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(WorkflowStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Add a progress report to this update.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl Workflow {
    fn reject(&self, to: WorkflowStatus) -> EvaError {
        EvaError::invalid_transition("workflow", self.id, self.status, to)
    }

    /// Merge `update`, enforcing the pending -> active -> completed|failed machine.
    ///
    /// Completion requires the workflow to be active. Failure is accepted from
    /// pending too, which is how cancellation of unstarted work lands.
    fn apply(&mut self, update: WorkflowUpdate, now: DateTime<Utc>) -> EvaResult<()> {
        let target = update.status.unwrap_or(self.status);
        if self.status.is_terminal() {
            return Err(self.reject(target));
        }
        if target.rank() < self.status.rank() {
            return Err(self.reject(target));
        }
        if target == WorkflowStatus::Completed && self.status == WorkflowStatus::Pending {
            return Err(self.reject(target));
        }
        if target == WorkflowStatus::Failed {
            let message = update
                .error_message
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| {
                    EvaError::Workflow(format!(
                        "workflow {} cannot fail without an error message",
                        self.id
                    ))
                })?;
            self.error_message = Some(message.to_string());
        } else if let Some(message) = update.error_message {
            self.error_message = Some(message);
        }

        if let Some(progress) = update.progress {
            let progress = if progress.is_finite() {
                progress.clamp(0.0, 100.0)
            } else {
                0.0
            };
            self.progress = self.progress.max(progress);
        }

        self.status = match target {
            WorkflowStatus::Pending if self.progress > 0.0 => WorkflowStatus::Active,
            other => other,
        };
        if self.status == WorkflowStatus::Completed {
            self.progress = 100.0;
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// In-memory registry of workflows and their rollup state.
pub struct WorkflowTracker {
    workflows: Arc<RwLock<HashMap<Uuid, Workflow>>>,
    clock: SharedClock,
}

impl WorkflowTracker {
    /// An empty tracker stamping times from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            workflows: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Create a pending workflow at progress 0.
    pub async fn start(
        &self,
        name: impl Into<String>,
        agent_id: Option<Uuid>,
        metadata: Map<String, Value>,
    ) -> Workflow {
        self.insert(name.into(), agent_id, metadata, None).await
    }

    /// Like [`start`](Self::start), with progress derived from finished steps.
    pub async fn start_with_steps(
        &self,
        name: impl Into<String>,
        agent_id: Option<Uuid>,
        metadata: Map<String, Value>,
        total_steps: u32,
    ) -> EvaResult<Workflow> {
        if total_steps == 0 {
            return Err(EvaError::Validation(
                "a stepped workflow needs at least one step".into(),
            ));
        }
        Ok(self
            .insert(name.into(), agent_id, metadata, Some(total_steps))
            .await)
    }

    async fn insert(
        &self,
        name: String,
        agent_id: Option<Uuid>,
        metadata: Map<String, Value>,
        total_steps: Option<u32>,
    ) -> Workflow {
        let now = self.clock.now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            name,
            agent_id,
            status: WorkflowStatus::Pending,
            progress: 0.0,
            metadata,
            error_message: None,
            total_steps,
            completed_steps: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.workflows
            .write()
            .await
            .insert(workflow.id, workflow.clone());
        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow started");
        workflow
    }

    /// Merge a partial update. Rejected updates leave the workflow unchanged.
    pub async fn update(&self, id: Uuid, update: WorkflowUpdate) -> EvaResult<Workflow> {
        let now = self.clock.now();
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| EvaError::not_found("workflow", id))?;
        let before = workflow.status;
        // Stage on a copy so a rejected update leaves no trace.
        let mut next = workflow.clone();
        next.apply(update, now)?;
        *workflow = next;
        if workflow.status != before {
            info!(workflow_id = %id, from = %before, to = %workflow.status, "Workflow status changed");
        }
        Ok(workflow.clone())
    }

    /// Bookkeeping cancellation: pending/active -> failed. In-flight work is not stopped.
    pub async fn cancel(&self, id: Uuid) -> EvaResult<Workflow> {
        self.update(id, WorkflowUpdate::failed(CANCELLED_MESSAGE))
            .await
    }

    /// Roll one successful step into the workflow.
    ///
    /// Late reports for a workflow that already finished are ignored.
    pub async fn record_step_completed(&self, id: Uuid) -> EvaResult<Workflow> {
        let now = self.clock.now();
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| EvaError::not_found("workflow", id))?;
        if workflow.status.is_terminal() {
            debug!(workflow_id = %id, status = %workflow.status, "Ignoring step for finished workflow");
            return Ok(workflow.clone());
        }

        workflow.completed_steps += 1;
        if workflow.status == WorkflowStatus::Pending {
            workflow.apply(WorkflowUpdate::status(WorkflowStatus::Active), now)?;
        }
        let update = match workflow.total_steps {
            Some(total) if workflow.completed_steps >= total => {
                WorkflowUpdate::status(WorkflowStatus::Completed)
            }
            Some(total) => WorkflowUpdate::status(WorkflowStatus::Active)
                .with_progress(workflow.completed_steps as f64 * 100.0 / total as f64),
            None => WorkflowUpdate::status(WorkflowStatus::Active),
        };
        workflow.apply(update, now)?;
        debug!(workflow_id = %id, completed_steps = workflow.completed_steps, progress = workflow.progress, "Workflow step completed");
        Ok(workflow.clone())
    }

    /// A step failed for good: the workflow fails with its error.
    pub async fn record_step_failed(&self, id: Uuid, error: &str) -> EvaResult<Workflow> {
        let now = self.clock.now();
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| EvaError::not_found("workflow", id))?;
        if workflow.status.is_terminal() {
            debug!(workflow_id = %id, status = %workflow.status, "Ignoring failure for finished workflow");
            return Ok(workflow.clone());
        }
        workflow.apply(WorkflowUpdate::failed(format!("step failed: {error}")), now)?;
        info!(workflow_id = %id, error, "Workflow failed");
        Ok(workflow.clone())
    }

    /// One workflow by id.
    pub async fn get(&self, id: Uuid) -> EvaResult<Workflow> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EvaError::not_found("workflow", id))
    }

    /// All workflows, optionally by status, oldest first.
    pub async fn list(&self, status: Option<WorkflowStatus>) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut list: Vec<Workflow> = workflows
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }
}

impl Default for WorkflowTracker {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_is_pending() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("Find candidates", None, Map::new()).await;
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.progress, 0.0);
        assert_eq!(tracker.get(wf.id).await.unwrap(), wf);
    }

    #[tokio::test]
    async fn test_progress_activates_and_is_monotonic() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;

        let wf = tracker
            .update(wf.id, WorkflowUpdate::progress(40.0))
            .await
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Active);

        let wf = tracker
            .update(wf.id, WorkflowUpdate::progress(10.0))
            .await
            .unwrap();
        assert_eq!(wf.progress, 40.0);

        let wf = tracker
            .update(wf.id, WorkflowUpdate::progress(250.0))
            .await
            .unwrap();
        assert_eq!(wf.progress, 100.0);
    }

    #[tokio::test]
    async fn test_failed_requires_message() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;
        let err = tracker
            .update(wf.id, WorkflowUpdate::status(WorkflowStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaError::Workflow(_)));
        assert_eq!(
            tracker.get(wf.id).await.unwrap().status,
            WorkflowStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_no_backwards_transition() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;
        tracker
            .update(wf.id, WorkflowUpdate::status(WorkflowStatus::Active))
            .await
            .unwrap();
        let err = tracker
            .update(wf.id, WorkflowUpdate::status(WorkflowStatus::Pending))
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_completed_stamps_and_fills_progress() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;
        tracker
            .update(wf.id, WorkflowUpdate::progress(30.0))
            .await
            .unwrap();
        let wf = tracker
            .update(wf.id, WorkflowUpdate::status(WorkflowStatus::Completed))
            .await
            .unwrap();
        assert_eq!(wf.progress, 100.0);
        assert!(wf.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_cannot_skip_to_completed() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;
        let err = tracker
            .update(wf.id, WorkflowUpdate::status(WorkflowStatus::Completed))
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        let wf = tracker.get(wf.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert!(wf.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_single_step_workflow_passes_through_active() {
        let tracker = WorkflowTracker::default();
        let wf = tracker
            .start_with_steps("w", None, Map::new(), 1)
            .await
            .unwrap();
        let wf = tracker.record_step_completed(wf.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.progress, 100.0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let tracker = WorkflowTracker::default();
        let wf = tracker.start("w", None, Map::new()).await;
        let wf = tracker.cancel(wf.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(tracker.cancel(wf.id).await.unwrap_err().is_invalid_transition());
    }

    #[tokio::test]
    async fn test_step_rollup() {
        let tracker = WorkflowTracker::default();
        let wf = tracker
            .start_with_steps("w", None, Map::new(), 4)
            .await
            .unwrap();
        let wf = tracker.record_step_completed(wf.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Active);
        assert_eq!(wf.progress, 25.0);

        let wf = tracker.record_step_failed(wf.id, "quota").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.error_message.as_deref(), Some("step failed: quota"));

        // A late success does not resurrect it.
        let wf = tracker.record_step_completed(wf.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.completed_steps, 1);
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let tracker = WorkflowTracker::default();
        assert!(matches!(
            tracker.get(Uuid::new_v4()).await,
            Err(EvaError::NotFound { .. })
        ));
    }
}
