//! APE Explorer Binary
//!
//! Runs an exploration over recorded UI snapshots and writes the action
//! log, the graph and the model snapshot to the output directory.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ape_agent::{AgentKind, ApeAgent, ApeConfig, DirectorySource, DryRunDevice, Explorer};

#[derive(Parser)]
#[command(name = "ape-explorer", about = "Model-based GUI exploration over recorded snapshots")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of snapshot documents, read in name order
    #[arg(long)]
    snapshots: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Maximum number of steps
    #[arg(long, default_value_t = 1000)]
    steps: u64,

    /// Selection policy: sata, random or replay
    #[arg(long)]
    agent: Option<AgentKind>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Action log to replay
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Package of the app under test
    #[arg(long)]
    package: Option<String>,

    /// Activity launched by start actions
    #[arg(long)]
    activity: Option<String>,

    /// Model snapshot to resume from and save to
    #[arg(long)]
    model: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut ApeConfig) {
        if let Some(dir) = self.snapshots {
            config.io.snapshot_dir = Some(dir);
        }
        if let Some(dir) = self.output {
            config.io.output_dir = dir;
        }
        if let Some(kind) = self.agent {
            config.agent.kind = kind;
        }
        if let Some(seed) = self.seed {
            config.agent.seed = Some(seed);
        }
        if let Some(log) = self.replay {
            config.agent.kind = AgentKind::Replay;
            config.agent.replay_log = Some(log);
        }
        if let Some(package) = self.package {
            config.agent.package = package;
        }
        if let Some(activity) = self.activity {
            config.agent.main_activity = activity;
        }
        if let Some(model) = self.model {
            config.io.model_path = Some(model);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting APE Explorer v{}", ape_common::VERSION);

    let args = Args::parse();
    let steps = args.steps;
    let mut config = ApeConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("validating configuration")?;

    let snapshot_dir = config
        .io
        .snapshot_dir
        .clone()
        .context("no snapshot directory; pass --snapshots or set APE_IO__SNAPSHOT_DIR")?;
    let source = DirectorySource::open(&snapshot_dir, config.io.tree_options())
        .with_context(|| format!("opening {}", snapshot_dir.display()))?;
    let agent = ApeAgent::from_config(&config).context("building the agent")?;

    let mut explorer = Explorer::new(agent, source, DryRunDevice::new(), &config)?;
    let stop = explorer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let model_path = config.io.model_path.clone();
    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let summary = explorer.run(steps)?;
        if let Some(path) = model_path {
            let agent = explorer.agent();
            ape_model::ModelSnapshot::save(&path, agent.inner().model(), agent.inner().controller())?;
        }
        Ok(summary)
    })
    .await
    .context("exploration task panicked")??;

    info!(
        "Exploration finished: steps={}, states={}, actions={}, reason={}",
        summary.steps,
        summary.states,
        summary.actions_performed,
        summary.stop_reason.as_deref().unwrap_or("step limit")
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
