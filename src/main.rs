use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use robotheus::config::{Config, Overrides};
use robotheus::registry::CounterRegistry;
use robotheus::scheduler::Scheduler;
use robotheus::telemetry::SelfMetrics;
use robotheus::{exposition, logging, providers};

#[derive(Parser)]
#[command(name = "robotheus")]
#[command(version, about = "Multi-provider AI usage and cost exporter for Prometheus")]
struct Cli {
    /// Address to listen on, e.g. ":9185" or "127.0.0.1:9185"
    #[arg(long = "web.listen-address", global = true)]
    listen_address: Option<String>,

    /// Collection interval, e.g. "60", "60s" or "5m"
    #[arg(long = "scrape.interval", global = true)]
    scrape_interval: Option<String>,

    /// Log level: debug, info, warn or error
    #[arg(long = "log.level", global = true)]
    log_level: Option<String>,

    /// Config file (default: ~/.config/robotheus/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Add a synthetic provider that needs no credentials
    #[arg(long, global = true)]
    mock: bool,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_ORG_ID", global = true)]
    openai_org_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect periodically and serve /metrics (default)
    Serve,
    /// Run one collection cycle and print the exposition
    Collect,
    /// Print the effective configuration with secrets redacted
    Config,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen_address: self.listen_address.clone(),
            scrape_interval: self.scrape_interval.clone(),
            log_level: self.log_level.clone(),
            openai_api_key: self.openai_api_key.clone(),
            openai_org_id: self.openai_org_id.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply(cli.overrides());
    logging::init(&config.general.log_level)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, cli.mock).await,
        Commands::Collect => collect_once(&config, cli.mock).await,
        Commands::Config => {
            print!("{}", config.redacted().to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: &Config, use_mock: bool) -> Result<()> {
    let interval = config.scrape_interval()?;
    let grace = config.shutdown_grace()?;
    let addr = config.listen_address()?;

    let providers = providers::from_config(config, use_mock)?;
    let registry = Arc::new(CounterRegistry::new());
    let metrics = Arc::new(SelfMetrics::new().context("Failed to create self-metrics")?);
    let scheduler = Scheduler::new(providers, registry.clone(), metrics.clone(), interval, grace);

    let shutdown = CancellationToken::new();
    let scheduler_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let served = exposition::serve(
        addr,
        exposition::AppState::new(registry, metrics),
        shutdown.clone(),
    )
    .await;

    // The server may also stop on its own (bind failure); stop collecting either way.
    shutdown.cancel();
    scheduler_task.await.context("Scheduler task panicked")?;
    served
}

async fn collect_once(config: &Config, use_mock: bool) -> Result<()> {
    let interval = config.scrape_interval()?;
    let providers = providers::from_config(config, use_mock)?;
    let registry = Arc::new(CounterRegistry::new());
    let metrics = Arc::new(SelfMetrics::new().context("Failed to create self-metrics")?);
    let scheduler = Scheduler::new(
        providers,
        registry.clone(),
        metrics,
        interval,
        config.shutdown_grace()?,
    );

    let results = scheduler.run_once().await;
    print!("{}", exposition::render(&registry));

    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, result)| result.is_err())
        .map(|(name, _)| *name)
        .collect();
    if failed.len() == results.len() {
        bail!("Every provider failed: {}", failed.join(", "));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
