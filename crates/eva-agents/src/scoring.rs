use crate::types::{Agent, HealthStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Tunable weights of the fitness formula.
///
/// Defaults reproduce the production tuning: 40 for free capacity, 20 for
/// reliability, the agent's own priority unweighted, 5 per matching
/// capability, 10 for a specialization match, and 0.7 / 0.3 multipliers for
/// degraded / unhealthy agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub availability: f64,
    pub reliability: f64,
    pub priority: f64,
    pub capability_bonus: f64,
    pub specialization_bonus: f64,
    pub degraded_multiplier: f64,
    pub unhealthy_multiplier: f64,
    /// Candidates scoring below this are not eligible.
    pub min_score: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            availability: 40.0,
            reliability: 20.0,
            priority: 1.0,
            capability_bonus: 5.0,
            specialization_bonus: 10.0,
            degraded_multiplier: 0.7,
            unhealthy_multiplier: 0.3,
            min_score: 0.0,
        }
    }
}

/// A scored candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    /// Agent being ranked.
    pub agent_id: Uuid,
    /// Fitness score, higher is better.
    pub score: f64,
    /// Load at ranking time, used as the tie-breaker.
    pub current_load: f64,
}

/// Pure function from (agent, task requirements) to a ranking score.
#[derive(Debug, Clone, Default)]
pub struct FitnessScorer {
    weights: ScoringWeights,
}

impl FitnessScorer {
    /// A scorer with the given weights.
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Weights in use.
    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score `agent` for a task of `task_type` needing `required_capabilities`.
    pub fn score(&self, agent: &Agent, task_type: &str, required_capabilities: &[String]) -> f64 {
        let w = &self.weights;
        let load = agent.current_load.clamp(0.0, 100.0);
        let success = agent.success_rate.clamp(0.0, 100.0);

        let mut total = w.availability * (1.0 - load / 100.0);
        total += w.reliability * success / 100.0;
        total += w.priority * f64::from(agent.priority);

        let matched = required_capabilities
            .iter()
            .filter(|cap| agent.capabilities.contains(cap.as_str()))
            .count();
        total += w.capability_bonus * matched as f64;

        if agent.specializations.contains(task_type) {
            total += w.specialization_bonus;
        }

        total * self.health_multiplier(agent.health_status)
    }

    fn health_multiplier(&self, health: HealthStatus) -> f64 {
        match health {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => self.weights.degraded_multiplier,
            HealthStatus::Unhealthy => self.weights.unhealthy_multiplier,
        }
    }

    /// All eligible agents, best first.
    ///
    /// Offline agents, agents at 100% load and agents below `min_score` are
    /// dropped. Ties go to the lower load, then the lower id.
    pub fn rank<'a, I>(
        &self,
        agents: I,
        task_type: &str,
        required_capabilities: &[String],
    ) -> Vec<Candidate>
    where
        I: IntoIterator<Item = &'a Agent>,
    {
        let mut candidates: Vec<Candidate> = agents
            .into_iter()
            .filter(|a| a.is_schedulable())
            .map(|a| Candidate {
                agent_id: a.id,
                score: self.score(a, task_type, required_capabilities),
                current_load: a.current_load,
            })
            .filter(|c| c.score >= self.weights.min_score)
            .collect();

        candidates.sort_by(compare_candidates);
        candidates
    }

    /// The best eligible agent, if any.
    pub fn select<'a, I>(
        &self,
        agents: I,
        task_type: &str,
        required_capabilities: &[String],
    ) -> Option<Candidate>
    where
        I: IntoIterator<Item = &'a Agent>,
    {
        self.rank(agents, task_type, required_capabilities)
            .into_iter()
            .next()
    }
}

/// Order candidates the way [`FitnessScorer::rank`] does.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.current_load.total_cmp(&b.current_load))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}
