//! `dagrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow JSON file and print its execution levels.
//! - `plan`: validate, allocate and optimize without running anything.
//! - `run`: execute the workflow with the dry-run executor.

mod logging;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::models::WorkflowStatus;
use engine::resources::estimate_cost;
use engine::{ExecutorRegistry, ParserOptions, Settings, WorkflowDefinition, WorkflowEngine};
use steps::{DryRunExecutor, StepExecutor};

#[derive(Parser)]
#[command(name = "dagrun", about = "DAG workflow orchestration engine", version)]
struct Cli {
    /// Settings file (TOML). `DAGRUN__*` environment variables override it.
    #[arg(long, global = true, env = "DAGRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Print the execution plan: levels, critical path, allocations and cost.
    Plan {
        path: PathBuf,
    },
    /// Execute a workflow with the dry-run executor.
    Run {
        path: PathBuf,
        /// Simulated duration of every step, in milliseconds.
        #[arg(long, default_value_t = 0)]
        step_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let ok = match cli.command {
        Command::Validate { path } => validate(&settings, &path)?,
        Command::Plan { path } => plan(&settings, &path)?,
        Command::Run { path, step_delay_ms } => run(&settings, &path, step_delay_ms).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Every workflow step is routed through the dry-run executor, whatever its key.
fn dry_run_engine(settings: &Settings, def: &WorkflowDefinition, delay: Duration) -> WorkflowEngine {
    let executor: Arc<dyn StepExecutor> = Arc::new(DryRunExecutor::with_delay(delay));
    let registry: ExecutorRegistry = def
        .steps()
        .iter()
        .map(|s| (s.executor_ref.clone(), executor.clone()))
        .collect::<HashMap<_, _>>();
    WorkflowEngine::new(registry, settings.engine_config())
}

/// The dry-run registry serves every key, so there is no executor set to
/// check against.
fn dry_run_parser_options(settings: &Settings) -> ParserOptions {
    let mut options = settings.parser_options(std::iter::empty());
    if options.known_executors.take().is_some() {
        warn!("parser.strict_executors is ignored: the dry-run executor serves every step");
    }
    options
}

fn load_workflow(settings: &Settings, path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let parser = engine::Parser::new(dry_run_parser_options(settings));
    let def = parser
        .parse_str(&content)
        .with_context(|| format!("cannot parse workflow {}", path.display()))?;
    info!(workflow_id = def.id(), version = def.version(), steps = def.steps().len(), "workflow loaded");
    Ok(def)
}

fn validate(settings: &Settings, path: &Path) -> Result<bool> {
    let def = load_workflow(settings, path)?;
    let validation = engine::validate_dag(&def);

    println!("{}", serde_json::to_string_pretty(&validation)?);
    if let Err(e) = validation.ensure_valid() {
        warn!("validation failed: {e}");
        return Ok(false);
    }
    Ok(true)
}

fn plan(settings: &Settings, path: &Path) -> Result<bool> {
    let def = load_workflow(settings, path)?;
    let engine = dry_run_engine(settings, &def, Duration::ZERO);

    let validation = engine.validator().validate(&def);
    if let Err(e) = validation.ensure_valid() {
        println!("{}", serde_json::to_string_pretty(&*validation)?);
        warn!("validation failed: {e}");
        return Ok(false);
    }

    let allocation = engine.allocator().reserve(&def, engine.config().allocation_strategy)?;
    let capacity = engine.allocator().snapshot().capacity;
    let optimization = engine.optimizer().optimize(&def, &validation, &allocation, &capacity);
    engine.allocator().release(&allocation);
    let optimization = optimization?;
    let cost = estimate_cost(&allocation, &def.durations(), &Default::default());

    let report = json!({
        "workflowId": def.id(),
        "version": def.version(),
        "graphMetrics": validation.graph_metrics,
        "inferredDependencies": def.inferred_dependencies(),
        "ambiguousOutputs": def.ambiguous_outputs(),
        "optimization": optimization,
        "allocation": allocation,
        "cost": cost,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(true)
}

async fn run(settings: &Settings, path: &Path, step_delay_ms: u64) -> Result<bool> {
    let def = load_workflow(settings, path)?;
    let engine = dry_run_engine(settings, &def, Duration::from_millis(step_delay_ms));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling workflow");
            on_signal.cancel();
        }
    });

    let result = engine.execute_with_cancellation(&def, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.status == WorkflowStatus::Completed)
}
