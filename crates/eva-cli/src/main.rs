mod config;
mod handlers;

use crate::config::{EvaConfig, StoreKind};
use crate::handlers::EchoHandler;
use clap::{Parser, Subcommand};
use eva_agents::{AgentFilter, AgentRegistry, FitnessScorer};
use eva_core::{SharedClock, SystemClock};
use eva_orchestrator::Orchestrator;
use eva_queue::{EnqueueOptions, MemoryQueueStore, QueueName, QueueStore, SqliteQueueStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "eva", about = "EVA — agent task dispatch and durable work queues")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "eva.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every queue processor, the scheduler and the metric loop until Ctrl-C
    Run,
    /// Add an item to a queue
    Enqueue {
        queue: QueueName,
        /// JSON payload
        payload: String,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        #[arg(long, default_value_t = 0)]
        delay_ms: i64,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        workflow: Option<Uuid>,
    },
    /// Show queue health
    Health {
        /// Only this queue
        queue: Option<QueueName>,
    },
    /// Inspect or requeue dead letters
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Reset a failed item to pending with a fresh retry budget
    Retry { id: Uuid },
    /// Cancel a pending item
    Cancel { id: Uuid },
    /// Rank the configured agents for a task type
    Score {
        task_type: String,
        /// Required capability (repeatable)
        #[arg(long = "cap")]
        capabilities: Vec<String>,
    },
    /// List the configured agents
    Agents,
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead letters, oldest first
    List { queue: Option<QueueName> },
    /// Put a dead letter back on its queue
    Requeue { id: Uuid },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(config: &EvaConfig, clock: SharedClock) -> anyhow::Result<Arc<dyn QueueStore>> {
    let configs = config.queue_configs()?;
    let store: Arc<dyn QueueStore> = match config.store.kind {
        StoreKind::Sqlite => Arc::new(SqliteQueueStore::open(config.sqlite_path(), configs, clock)?),
        StoreKind::Memory => Arc::new(MemoryQueueStore::new(configs, clock)),
    };
    Ok(store)
}

fn build_registry(config: &EvaConfig, clock: SharedClock) -> anyhow::Result<Arc<AgentRegistry>> {
    let registry = AgentRegistry::new(FitnessScorer::new(config.scoring.clone()), clock);
    for agent in &config.agents {
        registry.register(agent.clone())?;
    }
    info!(count = registry.agent_count(), "Agents registered from config");
    Ok(Arc::new(registry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = EvaConfig::load(&cli.config).await?;
    let clock = SystemClock::shared();
    if config.store.kind == StoreKind::Memory && !matches!(cli.command, Commands::Run) {
        warn!("The memory store starts empty on every invocation");
    }

    match cli.command {
        Commands::Run => {
            let store = open_store(&config, clock.clone())?;
            let registry = build_registry(&config, clock.clone())?;
            let mut orchestrator = Orchestrator::new(store, registry)
                .with_configs(config.queue_configs()?)
                .with_schedules(config.schedules.clone())
                .with_clock(clock)
                .with_poll_interval(config.poll_interval())
                .with_snapshot_interval(config.snapshot_interval());
            for queue in QueueName::ALL {
                orchestrator = orchestrator.with_handler(queue, Arc::new(EchoHandler));
            }

            let handle = orchestrator.start()?;
            info!("EVA running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
        Commands::Enqueue {
            queue,
            payload,
            priority,
            delay_ms,
            max_retries,
            workflow,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {e}"))?;
            let mut options = EnqueueOptions::default()
                .priority(priority)
                .delay_ms(delay_ms);
            if let Some(n) = max_retries {
                options = options.max_retries(n);
            }
            if let Some(id) = workflow {
                options = options.workflow(id);
            }
            let store = open_store(&config, clock)?;
            let item = store.enqueue(queue, payload, options).await?;
            print_json(&item)?;
        }
        Commands::Health { queue } => {
            let store = open_store(&config, clock)?;
            let queues = match queue {
                Some(q) => vec![q],
                None => QueueName::ALL.to_vec(),
            };
            let mut report = Vec::with_capacity(queues.len());
            for q in queues {
                report.push(store.health(q).await?);
            }
            print_json(&report)?;
        }
        Commands::DeadLetters { action } => {
            let store = open_store(&config, clock)?;
            match action {
                DeadLetterAction::List { queue } => {
                    let dead = store.dead_letters(queue).await?;
                    if dead.is_empty() {
                        println!("No dead letters.");
                    } else {
                        print_json(&dead)?;
                    }
                }
                DeadLetterAction::Requeue { id } => {
                    let item = store.requeue_dead_letter(id).await?;
                    print_json(&item)?;
                }
            }
        }
        Commands::Retry { id } => {
            let store = open_store(&config, clock)?;
            print_json(&store.retry(id).await?)?;
        }
        Commands::Cancel { id } => {
            let store = open_store(&config, clock)?;
            print_json(&store.cancel(id).await?)?;
        }
        Commands::Score {
            task_type,
            capabilities,
        } => {
            let registry = build_registry(&config, clock)?;
            let ranked = registry.rank(&task_type, &capabilities);
            if ranked.is_empty() {
                println!("No eligible agents for '{task_type}'.");
            } else {
                for c in &ranked {
                    let name = registry.get(c.agent_id).map(|a| a.name).unwrap_or_default();
                    println!(
                        "  {:>6.1}  {} ({}, load {:.0}%)",
                        c.score, name, c.agent_id, c.current_load
                    );
                }
            }
        }
        Commands::Agents => {
            let registry = build_registry(&config, clock)?;
            let agents = registry.list(&AgentFilter::default());
            if agents.is_empty() {
                println!("No agents configured.");
                println!("Configure agents in eva.toml under [[agents]]");
            } else {
                for a in &agents {
                    let caps: Vec<&str> = a.capabilities.iter().map(String::as_str).collect();
                    println!(
                        "  {} — {} [{}] max {} caps: {}",
                        a.name,
                        a.agent_type,
                        a.status,
                        a.max_concurrent_tasks,
                        caps.join(", ")
                    );
                }
                println!("\nTotal: {} agent(s)", agents.len());
            }
        }
    }

    Ok(())
}
