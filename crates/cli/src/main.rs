//! `casework` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: run publish-time validation on a workflow bundle.
//! - `evaluate`: evaluate one decision table against a context.
//! - `run`: execute a bundle end to end against an in-memory store.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use db::models::CaseStatus;
use db::pool::PoolConfig;
use db::MemoryStore;
use engine::{Catalog, EngineConfig, StepRegistry, WorkflowBundle, WorkflowEngine};
use notify::LogNotifier;
use serde_json::{json, Map, Value};
use steps::clock::SystemClock;
use steps::rules::{DecisionTable, Evaluation};
use steps::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "casework",
    about = "Workflow engine for tax-resolution casework",
    version
)]
struct Cli {
    /// Most steps a single advance may run before the case is failed.
    #[arg(long, global = true, env = "CASEWORK_MAX_CHAIN", default_value_t = 256)]
    max_chain: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow bundle JSON file.
    Validate {
        /// Path to the bundle (definition, version, tables, formulas).
        path: PathBuf,
    },
    /// Evaluate a decision table against a context.
    Evaluate {
        #[arg(long)]
        table: PathBuf,
        /// Context as a JSON object.
        #[arg(long, default_value = "{}")]
        context: String,
    },
    /// Run a bundle in memory, answering human tasks from `--decision`.
    Run {
        path: PathBuf,
        /// Initial case context as a JSON object.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Decision for the next human task, as a JSON object. Repeatable.
        #[arg(long = "decision")]
        decisions: Vec<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, env = "CASEWORK_DB_MAX_CONNECTIONS", default_value_t = 2)]
        max_connections: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let bundle: WorkflowBundle = read_json(&path)?;
            match bundle.validate() {
                Ok(order) => println!("✅ Bundle is valid. Step order: {order:?}"),
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Evaluate { table, context } => {
            let table: DecisionTable = read_json(&table)?;
            table
                .validate()
                .with_context(|| format!("decision table '{}' is invalid", table.name))?;
            let context = Context::new(object(&context, "--context")?);

            let report = match table.evaluate(&context)? {
                Evaluation::Matched(hit) => json!({
                    "matched": true,
                    "priority": hit.priority,
                    "rule": hit.rule,
                    "outcome": hit.outcome,
                    "output": hit.output,
                }),
                Evaluation::NoMatch => json!({ "matched": false, "no_match": table.no_match }),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run {
            path,
            context,
            decisions,
        } => {
            let bundle: WorkflowBundle = read_json(&path)?;
            let context = object(&context, "--context")?;
            let decisions = decisions
                .iter()
                .map(|d| object(d, "--decision"))
                .collect::<anyhow::Result<Vec<_>>>()?;
            run(
                bundle,
                context,
                decisions,
                EngineConfig {
                    max_chain_length: cli.max_chain,
                },
            )
            .await?;
        }
        Command::Migrate {
            database_url,
            max_connections,
        } => {
            let config = PoolConfig {
                max_connections,
                ..PoolConfig::new(database_url)
            };
            let pool = db::pool::create_pool(&config)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("Migrations applied successfully");
        }
    }
    Ok(())
}

async fn run(
    bundle: WorkflowBundle,
    context: Map<String, Value>,
    decisions: Vec<Map<String, Value>>,
    config: EngineConfig,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(LogNotifier);
    let clock = Arc::new(SystemClock);
    let registry = StepRegistry::standard(store.clone(), notifier.clone(), clock.clone());
    let engine = WorkflowEngine::new(store.clone(), registry, notifier, clock.clone(), config);
    let catalog = Catalog::new(store, clock);

    let version_id = bundle.version.id;
    catalog.install(&bundle).await?;
    catalog.publish(version_id).await?;

    let mut case = engine
        .start_case(version_id, Uuid::new_v4(), context)
        .await?;
    let mut decisions = decisions.into_iter();
    while case.status == CaseStatus::Suspended {
        let Some(decision) = decisions.next() else {
            warn!(case_id = %case.id, "no decision left; case stays suspended");
            break;
        };
        let state = engine.get_case_state(case.id).await?;
        let Some(task) = state.open_tasks.first() else {
            bail!("case {} is suspended without an open task", case.id);
        };
        info!(task_id = %task.id, step_id = %task.step_id, "answering human task");
        case = engine.complete_human_task(task.id, decision, "cli").await?;
    }

    let report = json!({
        "state": engine.get_case_state(case.id).await?,
        "history": engine.history(case.id).await?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn object(raw: &str, flag: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).with_context(|| format!("{flag} is not valid JSON"))? {
        Value::Object(map) => Ok(map),
        other => bail!("{flag} must be a JSON object, got {other}"),
    }
}
