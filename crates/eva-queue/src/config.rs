use crate::backoff::BackoffPolicy;
use crate::item::{millis, QueueName, MAX_DELAY_MS};
use chrono::Duration;
use eva_core::{EvaError, EvaResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-queue processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on items processing at once for this queue.
    pub max_concurrency: usize,
    /// Default retry budget for new items.
    pub max_retries: u32,
    /// Per-item execution timeout; also the processing lease length.
    pub timeout_ms: u64,
    pub backoff: BackoffPolicy,
    /// Whether items must be bound to an agent before running.
    pub agent_affinity: bool,
    /// Capabilities the scorer rewards for this queue's work.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl QueueConfig {
    /// Built-in defaults for a known queue.
    pub fn for_queue(queue: QueueName) -> Self {
        let (max_concurrency, max_retries, timeout_secs, agent_affinity, caps): (
            usize,
            u32,
            u64,
            bool,
            &[&str],
        ) = match queue {
            QueueName::Search => (5, 3, 30, true, &["web_search"]),
            QueueName::ContentGeneration => (3, 3, 120, true, &["llm"]),
            QueueName::ResumeParsing => (2, 2, 90, true, &["document_parsing"]),
            QueueName::Outreach => (4, 5, 60, true, &["email"]),
            QueueName::CrmSync => (2, 5, 60, false, &[]),
            QueueName::Notifications => (10, 3, 10, false, &[]),
        };
        Self {
            max_concurrency,
            max_retries,
            timeout_ms: timeout_secs * 1_000,
            backoff: BackoffPolicy::default(),
            agent_affinity,
            required_capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// Processing lease length.
    pub fn lease(&self) -> Duration {
        millis(self.timeout_ms)
    }

    /// Per-item execution timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Reject settings the processor cannot run with.
    pub fn validate(&self, queue: QueueName) -> EvaResult<()> {
        if self.max_concurrency == 0 {
            return Err(EvaError::Config(format!(
                "queue '{queue}': max_concurrency must be at least 1"
            )));
        }
        if self.timeout_ms == 0 {
            return Err(EvaError::Config(format!(
                "queue '{queue}': timeout_ms must be positive"
            )));
        }
        if self.timeout_ms > MAX_DELAY_MS {
            return Err(EvaError::Config(format!(
                "queue '{queue}': timeout_ms must not exceed {MAX_DELAY_MS}"
            )));
        }
        if self.backoff.max_delay_ms > MAX_DELAY_MS {
            return Err(EvaError::Config(format!(
                "queue '{queue}': backoff max_delay_ms must not exceed {MAX_DELAY_MS}"
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(EvaError::Config(format!(
                "queue '{queue}': backoff jitter must be within 0..=1"
            )));
        }
        Ok(())
    }
}

/// A partial `[[queues]]` entry from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueOverride {
    pub name: QueueName,
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub backoff: Option<BackoffPolicy>,
    pub agent_affinity: Option<bool>,
    pub required_capabilities: Option<Vec<String>>,
}

impl QueueOverride {
    /// An override that changes nothing.
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            max_concurrency: None,
            max_retries: None,
            timeout_ms: None,
            backoff: None,
            agent_affinity: None,
            required_capabilities: None,
        }
    }

    fn apply(self, base: &mut QueueConfig) {
        if let Some(v) = self.max_concurrency {
            base.max_concurrency = v;
        }
        if let Some(v) = self.max_retries {
            base.max_retries = v;
        }
        if let Some(v) = self.timeout_ms {
            base.timeout_ms = v;
        }
        if let Some(v) = self.backoff {
            base.backoff = v;
        }
        if let Some(v) = self.agent_affinity {
            base.agent_affinity = v;
        }
        if let Some(v) = self.required_capabilities {
            base.required_capabilities = v;
        }
    }
}

/// Configuration of every known queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfigs {
    configs: BTreeMap<QueueName, QueueConfig>,
}

impl QueueConfigs {
    /// Built-in defaults with `overrides` applied on top.
    pub fn with_overrides(overrides: Vec<QueueOverride>) -> EvaResult<Self> {
        let mut configs = Self::default();
        for o in overrides {
            let name = o.name;
            let entry = configs
                .configs
                .entry(name)
                .or_insert_with(|| QueueConfig::for_queue(name));
            o.apply(entry);
        }
        for (name, cfg) in &configs.configs {
            cfg.validate(*name)?;
        }
        Ok(configs)
    }

    /// Settings for one queue.
    pub fn get(&self, queue: QueueName) -> QueueConfig {
        self.configs
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| QueueConfig::for_queue(queue))
    }

    /// Replace one queue's settings.
    pub fn set(&mut self, queue: QueueName, config: QueueConfig) {
        self.configs.insert(queue, config);
    }

    /// Every queue with its settings.
    pub fn iter(&self) -> impl Iterator<Item = (QueueName, &QueueConfig)> {
        self.configs.iter().map(|(k, v)| (*k, v))
    }
}

impl Default for QueueConfigs {
    fn default() -> Self {
        Self {
            configs: QueueName::ALL
                .into_iter()
                .map(|q| (q, QueueConfig::for_queue(q)))
                .collect(),
        }
    }
}
