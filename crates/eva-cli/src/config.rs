//! `eva.toml` loading.

use eva_agents::{NewAgent, ScoringWeights};
use eva_core::EvaResult;
use eva_orchestrator::ScheduledJob;
use eva_queue::{QueueConfigs, QueueOverride};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct EvaConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub queues: Vec<QueueOverride>,
    #[serde(default)]
    pub agents: Vec<NewAgent>,
    #[serde(default)]
    pub schedules: Vec<ScheduledJob>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// SQLite file; `<data_dir>/queue.db` when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_snapshot_interval() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    1_000
}

impl EvaConfig {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml(&raw)
    }

    /// Built-in queue settings with the `[[queues]]` overrides applied.
    pub fn queue_configs(&self) -> EvaResult<QueueConfigs> {
        QueueConfigs::with_overrides(self.queues.clone())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("queue.db"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.processor.poll_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.snapshot_interval_secs)
    }
}
