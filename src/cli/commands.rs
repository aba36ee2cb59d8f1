//! CLI command definitions for the sandbox worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{load_config_file, transform::TransformRegistry};
use crate::engine::{EngineRegistry, MockEngine, MockEngineConfig};
use crate::manager::{LocalArtifactStore, ManagerStats, TaskManager, TaskManagerConfig};
use crate::metrics::{init_metrics, write_metrics};
use crate::queue::{
    HttpQueue, MemoryQueue, QueueService, QueueServiceConfig, TaskDefinition, WorkerIdentity,
};

/// Default directory for artifacts of local runs.
const DEFAULT_ARTIFACTS_DIR: &str = "./artifacts";

/// Worker that claims tasks from a queue and runs them in sandboxes.
#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Claim tasks from a queue and run them in sandboxes")]
#[command(version)]
#[command(
    long_about = "worker claims tasks from a remote queue, runs each one in a sandbox built by the configured engine, uploads its artifacts and reports the outcome.\n\nExample usage:\n  worker work --config worker.yml\n  worker run tasks.yml --capacity 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Claim and run tasks from the configured queue until interrupted.
    Work(WorkArgs),

    /// Run tasks from a local file on the mock engine and print outcomes.
    Run(RunArgs),

    /// Load and validate a config file without starting the worker.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),

    /// List the engines this binary was built with.
    Engines,
}

/// Arguments for `worker work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Path to the worker config file.
    #[arg(short, long, env = "WORKER_CONFIG")]
    pub config: PathBuf,

    /// Write Prometheus metrics to this file on exit.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `worker run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML or JSON file with one task definition or a list of them.
    pub tasks: PathBuf,

    /// Number of tasks to run at once.
    #[arg(short = 'c', long, default_value = "1")]
    pub capacity: usize,

    /// Directory for extracted artifacts.
    #[arg(short = 'o', long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts: PathBuf,

    /// Stop a sandbox that runs longer than this many seconds.
    #[arg(long)]
    pub max_run_time: Option<u64>,
}

/// Arguments for `worker check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Path to the worker config file.
    #[arg(short, long, env = "WORKER_CONFIG")]
    pub config: PathBuf,
}

/// Parse CLI arguments without exiting the process.
pub fn parse_cli() -> Result<Cli, clap::Error> {
    Cli::try_parse()
}

/// Exit code for a parse error: 0 for help and version output, 1 otherwise.
pub fn usage_exit_code(error: &clap::Error) -> u8 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For control over logging initialization and exit codes, use
/// `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli()?;
    run_with_cli(cli).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Work(args) => run_work_command(args).await,
        Commands::Run(args) => run_local_command(args).await,
        Commands::CheckConfig(args) => run_check_config_command(args).await,
        Commands::Engines => run_engines_command(),
    }
}

// ============================================================================
// Work
// ============================================================================

async fn run_work_command(args: WorkArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let engines = EngineRegistry::with_defaults()?;
    let transforms = TransformRegistry::with_defaults()?;
    let config = load_config_file(&args.config, &transforms)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.validate_engine(&engines)?;

    let engine = engines
        .create(&config.engine, config.engine_config())
        .with_context(|| format!("Failed to create engine '{}'", config.engine))?;
    let remote = HttpQueue::new(config.queue_base_url.clone(), config.credentials.clone())
        .context("Failed to create queue client")?;
    let queue = QueueService::new(Arc::new(remote), config.queue_service_config());
    let store = LocalArtifactStore::new(&config.artifacts_dir);

    info!(
        engine = %config.engine,
        worker_id = %config.worker_id,
        queue = %config.queue_base_url,
        client_id = %config.credentials.client_id,
        "Starting worker"
    );

    let manager = TaskManager::new(config.task_manager_config(), engine, queue, Arc::new(store));
    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        shutdown.cancel();
    });

    let stats = manager.run().await?;

    if let Some(path) = &args.metrics_file {
        write_metrics(path)
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }
    print_stats(&stats);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_stats(stats: &ManagerStats) {
    println!("Claimed:     {}", stats.claimed);
    println!("Completed:   {}", stats.completed);
    println!("Failed:      {}", stats.failed);
    println!("Exceptions:  {}", stats.exceptions);
    println!("Claims lost: {}", stats.claims_lost);
    if stats.unresolved > 0 {
        println!("Unresolved:  {}", stats.unresolved);
    }
}

// ============================================================================
// Run
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    Many(Vec<TaskDefinition>),
    One(Box<TaskDefinition>),
}

/// Reads task definitions from a YAML or JSON file.
async fn read_task_file(path: &Path) -> anyhow::Result<Vec<TaskDefinition>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let tasks: TaskFile = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse tasks from {}", path.display()))?;
    Ok(match tasks {
        TaskFile::Many(tasks) => tasks,
        TaskFile::One(task) => vec![*task],
    })
}

async fn run_local_command(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.capacity >= 1, "--capacity must be at least 1");

    let mut tasks = read_task_file(&args.tasks).await?;
    anyhow::ensure!(!tasks.is_empty(), "{} contains no tasks", args.tasks.display());
    if let Some(limit) = args.max_run_time {
        for task in &mut tasks {
            task.max_run_time.get_or_insert(limit);
        }
    }

    let remote = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
    let keys: Vec<_> = tasks.into_iter().map(|task| remote.push_task(task)).collect();

    let worker = WorkerIdentity {
        provisioner_id: "local".to_string(),
        worker_type: "mock".to_string(),
        worker_group: "local".to_string(),
        worker_id: format!("local-{}", uuid::Uuid::new_v4()),
    };
    let queue = QueueService::new(
        Arc::clone(&remote) as Arc<dyn crate::queue::RemoteQueue>,
        QueueServiceConfig::new(worker),
    );
    let config = TaskManagerConfig::new(args.capacity)
        .with_poll_interval(Duration::from_millis(50))
        .with_max_tasks(keys.len() as u64);
    let engine = Arc::new(MockEngine::new(MockEngineConfig::default()));
    let store = LocalArtifactStore::new(&args.artifacts);
    let manager = TaskManager::new(config, engine, queue, Arc::new(store));

    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let stats = manager.run().await?;

    println!();
    println!("{:<20} OUTCOME", "RUN");
    for key in &keys {
        let outcome = remote
            .resolution(key)
            .map_or_else(|| "unresolved".to_string(), |outcome| outcome.to_string());
        println!("{:<20} {}", key.to_string(), outcome);
    }
    println!();
    println!("Artifacts: {}", args.artifacts.display());
    print_stats(&stats);
    Ok(())
}

// ============================================================================
// Check config / engines
// ============================================================================

async fn run_check_config_command(args: CheckConfigArgs) -> anyhow::Result<()> {
    let engines = EngineRegistry::with_defaults()?;
    let transforms = TransformRegistry::with_defaults()?;
    let config = load_config_file(&args.config, &transforms)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.validate_engine(&engines)?;
    engines
        .create(&config.engine, config.engine_config())
        .with_context(|| format!("Invalid config for engine '{}'", config.engine))?;

    println!("Config OK: {}", args.config.display());
    println!("  engine:       {}", config.engine);
    println!("  queue:        {}", config.queue_base_url);
    println!("  worker:       {}/{}/{}", config.provisioner_id, config.worker_type, config.worker_id);
    println!("  capacity:     {}", config.max_capacity);
    println!("  artifacts:    {}", config.artifacts_dir.display());
    Ok(())
}

fn run_engines_command() -> anyhow::Result<()> {
    let engines = EngineRegistry::with_defaults()?;
    for provider in engines.providers() {
        println!("{:<10} {}", provider.name(), provider.description());
    }
    Ok(())
}
