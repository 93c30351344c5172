//! Queue processing, agent dispatch, workflow tracking, and scheduling.
//!
//! Ties the agent registry and the durable queue store together: one
//! processor per queue claims due items, binds them to the best-fit agent,
//! runs the queue's handler under a timeout, and records the outcome on the
//! queue item, the agent, and the owning workflow.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Builds and starts every background loop; stopped through [`OrchestratorHandle`].
//! - [`QueueProcessor`] — Claims and executes items of one queue under its concurrency limit.
//! - [`QueueHandler`] — The per-queue work function.
//! - [`WorkflowTracker`] — Progress and terminal state of multi-step workflows.
//! - [`Monitor`] — Dashboard snapshot of agents, queues, and workflows.
//! - [`Scheduler`] — Cron-based job scheduler that enqueues recurring work.

/// Binding claimed items to agents.
pub mod dispatcher;
/// Orchestrator builder and lifecycle.
pub mod engine;
/// Dashboard snapshots and the metric snapshot loop.
pub mod monitor;
/// Per-queue processing loop and handler trait.
pub mod processor;
/// Cron-based job scheduler.
pub mod scheduler;
/// Workflow state machine and tracker.
pub mod workflow;

pub use dispatcher::Dispatcher;
pub use engine::{Orchestrator, OrchestratorHandle};
pub use monitor::{AggregateMetrics, DashboardSnapshot, Monitor};
pub use processor::{HandlerError, Job, QueueHandler, QueueProcessor};
pub use scheduler::{ScheduledJob, Scheduler};
pub use workflow::{Workflow, WorkflowStatus, WorkflowTracker, WorkflowUpdate, CANCELLED_MESSAGE};
