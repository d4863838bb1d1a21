//! Gauntlet CLI
//!
//! The `gauntlet` command runs a sprint's phases against the backends in a
//! TOML config and streams the sprint's events to stdout as JSON lines.
//!
//! ## Commands
//!
//! - `run`: execute phases in order and print the final report
//! - `validate-config`: load, override and validate a config file

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gauntlet_core::metrics::METRICS;
use gauntlet_core::{
    CancelSignal, CandidateExecutor, CommandBackend, DirWorkspaceProvider, EngineConfig, Event,
    EventEmitter, ObserverTransport, PhaseStateMachine, SprintReport, SprintRunner,
};
use gauntlet_state::{MemoryCheckpointStore, MemoryRecordStore, MemorySequenceCounter};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(version = gauntlet_core::VERSION)]
#[command(about = "Run competing model backends through judged, evaluated phases", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run phases for a sprint
    Run {
        /// Path to the engine config (TOML)
        #[arg(short, long, env = "GAUNTLET_CONFIG")]
        config: PathBuf,

        /// Sprint identifier, also the event room
        #[arg(short, long, default_value = "sprint")]
        sprint: String,

        /// What the sprint should achieve
        #[arg(short, long)]
        goal: String,

        /// Phase to run; repeat for several, executed in order
        #[arg(short, long = "phase", required = true)]
        phases: Vec<String>,

        /// Provision a workspace directory per sprint under this root
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Do not stream events to stdout
        #[arg(long)]
        quiet_events: bool,
    },

    /// Check a config file without running anything
    ValidateConfig {
        /// Path to the engine config (TOML)
        #[arg(short, long, env = "GAUNTLET_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    gauntlet_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            sprint,
            goal,
            phases,
            workspace_root,
            quiet_events,
        } => {
            let config = load_config(&config)?;
            let cancel = CancelSignal::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling sprint");
                    on_interrupt.cancel();
                }
            });

            let events: Option<Box<dyn Write + Send>> = if quiet_events {
                None
            } else {
                Some(Box::new(std::io::stdout()))
            };
            let report = cmd_run(
                &config,
                &sprint,
                &goal,
                &phases,
                workspace_root.as_deref(),
                events,
                &cancel,
            )
            .await;
            METRICS.flush();
            let report = report?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            match &report.failure {
                None => Ok(()),
                Some(failure) => anyhow::bail!("sprint {} failed: {}", report.sprint_id, failure.reason),
            }
        }
        Commands::ValidateConfig { config } => {
            let config = load_config(&config)?;
            println!(
                "✓ config ok: {} backend(s), {} evaluator(s), {} named judge(s), max_attempts={}",
                config.backends.len(),
                config.evaluators.len(),
                config.judges.len(),
                config.max_attempts
            );
            Ok(())
        }
    }
}

/// Load a config file, apply `GAUNTLET_*` overrides and validate it.
fn load_config(path: &Path) -> Result<EngineConfig> {
    let mut config =
        EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Wire a runner from `config` and execute `phases` for `sprint_id`.
///
/// When `events` is set, every event of the sprint's room is written to it
/// as one JSON object per line, in sequence order.
async fn cmd_run(
    config: &EngineConfig,
    sprint_id: &str,
    goal: &str,
    phases: &[String],
    workspace_root: Option<&Path>,
    events: Option<Box<dyn Write + Send>>,
    cancel: &CancelSignal,
) -> Result<SprintReport> {
    let backend = Arc::new(CommandBackend::new(config.commands.clone()));
    for b in &config.backends {
        if !config.commands.contains_key(&b.provider) {
            warn!(provider = %b.provider, "no command configured; its candidates will fail");
        }
    }

    let records = Arc::new(MemoryRecordStore::new());
    records.insert_sprint(sprint_id, goal).await;
    let emitter = Arc::new(EventEmitter::new(
        Arc::new(MemorySequenceCounter::new()),
        config.events.clone(),
    ));
    let evaluators = config
        .build_evaluators(backend.clone())
        .context("Failed to build evaluators")?;

    let mut runner = SprintRunner::new(
        records,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::clone(&emitter),
        Arc::new(CandidateExecutor::new(backend.clone())),
        config.backends.clone(),
        config.build_judges(backend),
        Arc::new(evaluators),
    )
    .with_machine(PhaseStateMachine::new(config.max_attempts, config.evaluation_mode));
    if let Some(root) = workspace_root.or(config.workspace_root.as_deref()) {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        runner = runner.with_workspaces(Arc::new(DirWorkspaceProvider::new(root)));
    }

    let forwarder = match events {
        Some(out) => {
            let observer = Arc::new(JsonLinesObserver::new("stdout", out));
            Some(emitter.attach_observer(sprint_id, 0, observer).await)
        }
        None => None,
    };

    info!(sprint = %sprint_id, phases = phases.len(), "starting sprint");
    let report = runner.run(sprint_id, phases, cancel).await;

    emitter.close_room(sprint_id).await;
    if let Some(forwarder) = forwarder {
        forwarder.await.context("Event forwarder panicked")?;
    }
    Ok(report?)
}

/// Writes each event as one JSON line.
struct JsonLinesObserver {
    id: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesObserver {
    fn new(id: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            id: id.into(),
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl ObserverTransport for JsonLinesObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}
