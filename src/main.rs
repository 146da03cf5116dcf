//! Conveyor worker and executor entry points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conveyor::config::Config;
use conveyor::executor::bootstrap::{PipelineOutcome, PipelineRegistry};
use conveyor::executor::pool::{run_slot, ExecutionPool, PoolOptions};
use conveyor::executor::queue::run_executor;
use conveyor::schemas::{ComponentDefinition, PipelineResult};
use conveyor::services::Services;
use conveyor::worker::{ManagerClient, Worker, WorkerOptions};

/// Conveyor - distributed data-pipeline execution
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed data-pipeline execution worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker: lease jobs from the manager and execute them
    Worker,

    /// Run the queue-backed remote executor
    Executor,

    /// Internal: process-pool slot serving pipeline requests on stdio
    #[command(hide = true)]
    PipelineSlot,
}

fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Built-in pipelines available without user registration.
fn builtin_registry() -> PipelineRegistry {
    let registry = PipelineRegistry::new();
    registry.register("identity", |ctx| {
        Ok(PipelineOutcome::Single(PipelineResult::Message(ctx.message)))
    });
    registry
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}

fn load_topic_definitions(config: &Config) -> Result<HashMap<String, ComponentDefinition>> {
    let Some(path) = &config.topics_file else {
        return Ok(HashMap::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading topic catalog from {}", path.display()))?;
    let definitions: Vec<ComponentDefinition> = serde_json::from_str(&raw)?;
    Ok(definitions
        .into_iter()
        .map(|definition| (definition.name.clone(), definition))
        .collect())
}

async fn run_worker(config: Config) -> Result<()> {
    let services = Services::new();
    let registry = builtin_registry();
    let topic_definitions = load_topic_definitions(&config)?;

    if config.metrics_enabled {
        let addr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = conveyor::metrics::start_metrics_server(addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }
    let _reporter = services
        .usage_metrics
        .start_reporter(Duration::from_secs(config.usage_report_interval_secs));

    let worker = Worker::new(
        WorkerOptions {
            worker_id: config.worker_id(),
            selector: config.selector.clone(),
            executors: config.executors.clone(),
            sync_interval: Duration::from_secs(config.sync_interval_secs),
        },
        ManagerClient::new(&config.manager_url),
        services,
        registry,
        topic_definitions,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));
    worker.run(shutdown_rx).await;
    Ok(())
}

async fn run_remote_executor(config: Config) -> Result<()> {
    let url = config
        .redis_url
        .clone()
        .context("CONVEYOR__REDIS_URL is required for the executor")?;
    let pool = ExecutionPool::start(
        &PoolOptions {
            worker_type: config.worker_type,
            worker_concurrency: config.worker_concurrency,
        },
        builtin_registry(),
        Vec::new(),
    )?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));
    run_executor(&url, &config.queue_prefix, Arc::new(pool), shutdown_rx).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The slot subcommand owns no runtime: the parent schedules it.
    if matches!(cli.command, Commands::PipelineSlot) {
        return Ok(run_slot(builtin_registry(), Vec::new())?);
    }

    setup_logging(&cli.log_level, cli.json_logs);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let config = Config::load()?;
            info!(version = env!("CARGO_PKG_VERSION"), "Starting conveyor");
            match cli.command {
                Commands::Worker => run_worker(config).await,
                Commands::Executor => run_remote_executor(config).await,
                Commands::PipelineSlot => unreachable!("handled before runtime start"),
            }
        })
}
