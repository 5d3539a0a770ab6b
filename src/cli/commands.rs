//! CLI command definitions for agentpool.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::runtime::Orchestrator;
use crate::task::{Priority, Task};

/// Adaptive task-orchestration engine for heterogeneous agent pools.
#[derive(Parser)]
#[command(name = "agentpool")]
#[command(about = "Orchestrate a pool of worker agents over shared redis queues")]
#[command(version)]
#[command(
    long_about = "agentpool schedules tasks onto the best available agent, scales \
agent processes with queue pressure, escalates task priorities over time, and \
rebalances queued work across agent types.\n\nExample usage:\n  agentpool run\n  \
agentpool submit --task-type backend --content 'fix the login API' --priority high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestration engine until interrupted.
    Run,

    /// Submit a task for scheduling.
    Submit(SubmitArgs),

    /// Print queue depths, fleet counts, and engine statistics.
    Stats,

    /// Move in-flight tasks back to pending queues after a crash.
    Recover(RecoverArgs),
}

/// Arguments for `agentpool submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// JSON file describing the task; other flags override its fields.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Task type (architecture, backend, api, debugging, ...).
    #[arg(short = 't', long)]
    pub task_type: Option<String>,

    /// Free-text task content.
    #[arg(short, long)]
    pub content: Option<String>,

    /// Explicit priority (critical, high, normal, low, deferred).
    #[arg(short, long)]
    pub priority: Option<String>,

    /// Comma-separated required capabilities.
    #[arg(long)]
    pub capabilities: Option<String>,
}

/// Arguments for `agentpool recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Agent type to recover; all configured types when omitted.
    #[arg(long)]
    pub agent_type: Option<String>,
}

/// Parse CLI arguments without executing commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Execute the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }

    match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Submit(args) => submit_task(config, args).await,
        Commands::Stats => print_stats(config).await,
        Commands::Recover(args) => recover(config, args).await,
    }
}

async fn run_engine(config: OrchestratorConfig) -> anyhow::Result<()> {
    metrics::init_metrics()?;
    let orchestrator = Orchestrator::connect(config).await?;
    orchestrator.start().await?;
    info!("Engine running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    orchestrator.shutdown().await?;
    Ok(())
}

async fn submit_task(config: OrchestratorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let mut task = match &args.file {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            serde_json::from_str::<Task>(&json)?
        }
        None => {
            let task_type = args
                .task_type
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--task-type is required without --file"))?;
            Task::new(task_type)
        }
    };

    if let Some(task_type) = args.task_type {
        task.task_type = task_type;
    }
    if let Some(content) = args.content {
        task.content = content;
    }
    if let Some(priority) = args.priority {
        task.priority = parse_priority(&priority)?;
    }
    if let Some(capabilities) = args.capabilities {
        task.required_capabilities = capabilities
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }

    let orchestrator = Orchestrator::connect(config).await?;
    let placement = orchestrator.submit_task(task).await?;
    println!(
        "Scheduled task {} on agent {} (queue position {}, predicted {}ms)",
        placement.task_id,
        placement.assigned_agent,
        placement.queue_position,
        placement.predicted_completion_ms
    );
    Ok(())
}

fn parse_priority(s: &str) -> anyhow::Result<Priority> {
    match s.trim().to_lowercase().as_str() {
        "critical" => Ok(Priority::Critical),
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        "deferred" => Ok(Priority::Deferred),
        other => anyhow::bail!("unknown priority '{other}'"),
    }
}

async fn print_stats(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::connect(config.clone()).await?;
    let store = orchestrator.store();

    println!("Queues:");
    for type_config in &config.agent_types {
        let agent_type = &type_config.agent_type;
        let pending = store.pending_len(agent_type).await?;
        let processing = store.processing_len(agent_type).await?;
        println!("  {agent_type}: pending={pending} processing={processing}");
    }
    println!("  failures: {}", store.failure_len().await?);

    println!("Agents:");
    let counts = orchestrator.registry().count_by_type().await;
    if counts.is_empty() {
        println!("  (none registered)");
    }
    for (agent_type, count) in counts {
        println!("  {agent_type}: {count}");
    }

    let scheduling = orchestrator.scheduling_stats().await;
    println!(
        "Scheduling: scheduled={} completed={} failed={} avg_completion_ms={:.0}",
        scheduling.total_scheduled,
        scheduling.total_completed,
        scheduling.total_failed,
        scheduling.average_completion_ms
    );
    Ok(())
}

async fn recover(config: OrchestratorConfig, args: RecoverArgs) -> anyhow::Result<()> {
    let types: Vec<String> = match args.agent_type {
        Some(agent_type) => vec![agent_type],
        None => config
            .agent_types
            .iter()
            .map(|t| t.agent_type.clone())
            .collect(),
    };

    let orchestrator = Orchestrator::connect(config).await?;
    let mut total = 0;
    for agent_type in types {
        let recovered = orchestrator.scaler().recover_processing(&agent_type).await?;
        println!("{agent_type}: recovered {recovered}");
        total += recovered;
    }
    println!("Total recovered: {total}");
    Ok(())
}
