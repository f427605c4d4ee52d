use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use pollsight_agent::{Agent, AgentConfig};
use pollsight_common::init_tracing;

/// Metrics polling agent for SNMP devices and SQL databases.
#[derive(Parser, Debug)]
#[command(name = "pollsight-agent")]
#[command(
    about = "Poll SNMP devices and SQL databases and report metrics upstream",
    long_about = None
)]
struct Args {
    /// Path to the configuration file (JSON5 format).
    /// Defaults to `<config dir>/pollsight/agent.json5`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Poll and aggregate but never submit upstream.
    #[arg(long)]
    collect_only: bool,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pollsight")
                .join("agent.json5")
        })
    }

    /// Load the configuration file with command line overrides applied.
    fn load_config(&self, path: &Path) -> pollsight_agent::Result<AgentConfig> {
        let mut config = AgentConfig::read(path)?;
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.collect_only {
            config.agent.collect_only = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config_path();

    // Load configuration
    let config = args
        .load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize tracing
    init_tracing(&config.logging).context("Failed to initialize tracing")?;

    tracing::info!(
        config = ?config_path,
        endpoints = config.endpoints.len(),
        queries = config.queries.len(),
        collect_only = config.agent.collect_only,
        "Starting pollsight-agent"
    );

    let agent = Arc::new(Agent::from_config(&config).context("Failed to build agent")?);

    if args.once {
        let report = agent.run_cycle().await;
        tracing::info!(
            records = report.records,
            failed = report.failed_endpoints(),
            "Single cycle finished"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    #[cfg(unix)]
    spawn_reload_handler(agent.clone(), args, config_path)?;

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(shutdown_rx).await })
    };

    tracing::info!("Agent running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    signal::ctrl_c().await?;

    tracing::info!("Shutting down, finishing current cycle...");
    let _ = shutdown_tx.send(true);
    runner.await.context("Poll loop task failed")?;

    tracing::info!("Goodbye!");

    Ok(())
}

/// Reload endpoints and queries on SIGHUP. An invalid file keeps the
/// current registry.
#[cfg(unix)]
fn spawn_reload_handler(agent: Arc<Agent>, args: Args, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!(config = ?path, "SIGHUP received, reloading configuration");

            let result = args
                .load_config(&path)
                .and_then(|config| agent.reload(&config));

            if let Err(e) = result {
                tracing::error!(error = %e, "Reload failed, keeping current configuration");
            }
        }
    });

    Ok(())
}
