//! Palisade agent binary entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use palisade_agent::server::AgentServer;
use palisade_collector_client::CollectorClient;
use palisade_core::config::AgentConfig;
use palisade_core::rules::loader::load_rules_from_directory;

/// Palisade - in-line web application firewall agent.
#[derive(Parser, Debug)]
#[command(name = "palisade-agent", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // PALISADE_LOG wins; otherwise the config debug flag picks the default.
    let env_filter = EnvFilter::try_from_env("PALISADE_LOG").unwrap_or_else(|_| {
        if config_debug_enabled(&args.config) {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(config = %args.config.display(), "palisade-agent starting");
    let mut config = AgentConfig::load(&args.config).context("loading configuration")?;

    if config.needs_tls() {
        let Some(ssl) = &config.ssl else {
            bail!("ssl section is required when a service listens on https or tcps");
        };
        for path in [&ssl.certificate, &ssl.key] {
            if !path.exists() {
                bail!("TLS file {} does not exist", path.display());
            }
        }
    }

    let rules = if config.rules.rules_directory.is_empty() {
        warn!("no rules were loaded because the rules directory was not specified");
        Vec::new()
    } else {
        match load_rules_from_directory(
            Path::new(&config.rules.rules_directory),
            &config.rules.ignore_rules_directories,
        ) {
            Ok(rules) => {
                info!(
                    count = rules.len(),
                    directory = %config.rules.rules_directory,
                    "loaded rules"
                );
                rules
            }
            Err(e) => {
                error!(error = %e, "could not load rules, continuing with an empty rule set");
                Vec::new()
            }
        }
    };

    let collector =
        CollectorClient::new(&config.collector_url).context("creating the collector client")?;
    if let Err(e) = collector.healthcheck().await {
        warn!(error = %e, "cannot reach the collector");
    }

    if config.uuid.is_empty() {
        match collector.register_agent().await {
            Ok(uuid) => {
                info!(%uuid, "registered with the collector");
                config.uuid = uuid;
                if let Err(e) = config.save(&args.config) {
                    warn!(error = %e, "could not persist the agent uuid to the configuration file");
                }
            }
            Err(e) => {
                warn!(error = %e, "could not register with the collector, log shipping disabled");
            }
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = AgentServer::new(Arc::new(config), Arc::new(rules), Arc::new(collector));
    let server_shutdown = shutdown_tx.clone();
    let server_task = tokio::spawn(async move { server.run(&server_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .context("listening for the shutdown signal")?;
    info!("shutdown signal received, draining listeners");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(Duration::from_secs(6), server_task).await {
        Ok(Ok(Ok(()))) => info!("palisade-agent stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task failed"),
        Err(_) => warn!("listeners did not stop within the drain window"),
    }
    Ok(())
}

/// Peek at the configuration file for the logging debug flag before the
/// subscriber is installed. Any parse problem surfaces later in
/// [`AgentConfig::load`] with proper context.
fn config_debug_enabled(path: &Path) -> bool {
    #[derive(Default, serde::Deserialize)]
    struct Peek {
        #[serde(default)]
        logging: PeekLogging,
    }
    #[derive(Default, serde::Deserialize)]
    struct PeekLogging {
        #[serde(default)]
        debug: bool,
    }

    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_yaml::from_str::<Peek>(&content).ok())
        .map(|peek| peek.logging.debug)
        .unwrap_or(false)
}
