mod shell;

use clap::{Parser, Subcommand};
use hive_core::{HiveConfig, NewPlanningRequest};
use hive_orchestrator::{Dispatcher, Queen, WorkerIdentity};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::shell::{ShellPlanner, ShellWorker};

#[derive(Parser)]
#[command(name = "hive", about = "Hive: SQLite-backed task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    /// Database file (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    Migrate,
    /// Run the queen maintenance loop until Ctrl-C
    Serve,
    /// Submit a planning request
    Submit {
        description: String,
        #[arg(short, long, default_value_t = 0)]
        priority: i64,
        #[arg(short, long, default_value = "cli")]
        requestor: String,
    },
    /// Show row counts, pool statistics and metrics
    Status,
    /// List open escalations
    Escalations {
        /// Include acknowledged escalations
        #[arg(long)]
        all: bool,
        /// Acknowledge an escalation instead of listing
        #[arg(long)]
        ack: Option<Uuid>,
    },
    /// Show a plan with its tasks and blocking tasks
    Plan { id: Uuid },
    /// Cancel a task that has not finished
    Cancel {
        task_id: Uuid,
        #[arg(short, long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Run a shell command for every task this worker claims
    Worker {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "shell")]
        role: String,
        /// Accepted task types; empty accepts any
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
        /// Command run through `sh -c`; the task JSON is in HIVE_TASK
        #[arg(long)]
        command: String,
    },
    /// Turn planning requests into plans with a shell command
    Planner {
        #[arg(long)]
        agent: Option<String>,
        /// Command run through `sh -c`; the request JSON is in HIVE_REQUEST and
        /// the plan draft JSON is read from stdout
        #[arg(long)]
        command: String,
    },
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if pretty {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<HiveConfig> {
    let mut config = HiveConfig::load(&cli.config)?;
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    Ok(config)
}

/// A watch channel flipped to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Ctrl-C handler failed, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = load_config(&cli)?;
    let queen = Queen::open(config).await?;

    match cli.command {
        Commands::Migrate => {
            let version = queen.store().schema_version().await?;
            println!(
                "{} is at schema version {version}",
                queen.config().database.display()
            );
        }
        Commands::Serve => {
            queen.run(shutdown_on_ctrl_c()).await?;
        }
        Commands::Submit {
            description,
            priority,
            requestor,
        } => {
            let request = queen
                .planner_api(queen.config().dispatch.agent_id.clone())
                .submit(NewPlanningRequest::new(description, requestor).with_priority(priority))
                .await?;
            print_json(&request)?;
        }
        Commands::Status => {
            print_json(&queen.status().await?)?;
        }
        Commands::Escalations { all, ack } => match ack {
            Some(id) => {
                if queen.acknowledge_escalation(id).await? {
                    println!("acknowledged {id}");
                } else {
                    anyhow::bail!("escalation {id} not found or already acknowledged");
                }
            }
            None => print_json(&queen.list_escalations(all).await?)?,
        },
        Commands::Plan { id } => {
            print_json(&queen.plan_report(id).await?)?;
        }
        Commands::Cancel { task_id, reason } => {
            print_json(&queen.cancel_task(task_id, &reason).await?)?;
        }
        Commands::Worker {
            id,
            role,
            capabilities,
            command,
        } => {
            let identity = WorkerIdentity::new(id, role).with_capabilities(capabilities);
            let api = queen.worker_api(identity);
            api.register().await?;
            let heartbeat = shell::spawn_heartbeat(api.clone(), queen.config().workers.heartbeat_ttl());

            let dispatcher = Dispatcher::new(
                api.task_source(),
                queen.config().dispatch.poll_interval(),
                Arc::clone(queen.monitor()),
            );
            let handler = ShellWorker::new(api.clone(), command);
            let result = dispatcher.run(&handler, shutdown_on_ctrl_c()).await;

            heartbeat.abort();
            api.deregister().await?;
            result?;
        }
        Commands::Planner { agent, command } => {
            let agent = agent.unwrap_or_else(|| queen.config().dispatch.agent_id.clone());
            let api = queen.planner_api(agent);
            let dispatcher = Dispatcher::new(
                api.planning_source(),
                queen.config().dispatch.poll_interval(),
                Arc::clone(queen.monitor()),
            );
            let handler = ShellPlanner::new(api, command);
            dispatcher.run(&handler, shutdown_on_ctrl_c()).await?;
        }
    }

    queen.store().pool().close();
    Ok(())
}
