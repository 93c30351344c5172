//! Agent registry and fitness scoring.
//!
//! Tracks every worker agent's capacity, load, capabilities and health, and
//! ranks agents for incoming work with a weighted fitness score.
//!
//! # Main types
//!
//! - [`AgentRegistry`] — Agents plus their execution records; the only writer of load.
//! - [`FitnessScorer`] — Pure `(agent, task requirements) -> score` function.
//! - [`Agent`] / [`AgentTask`] — The worker entity and its task bindings.
//! - [`AgentMetricSnapshot`] — Append-only load/performance history.

/// Agent registry with transactional load recompute.
pub mod registry;
/// Weighted fitness scoring.
pub mod scoring;
/// Agent, execution record and snapshot types.
pub mod types;

pub use registry::{AgentRegistry, Assignment, Retention};
pub use scoring::{Candidate, FitnessScorer, ScoringWeights};
pub use types::{
    Agent, AgentFilter, AgentMetricSnapshot, AgentStatus, AgentTask, AgentTaskRequest,
    AgentTaskStatus, HealthStatus, NewAgent, OVERLOAD_THRESHOLD,
};
