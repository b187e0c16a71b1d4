//! Worker process: serves connections handed over by the front process.
//!
//! Launched by the front with `PORT` and `HANDOFF_DESCRIPTOR_FD` set; see
//! `socket_handoff::delegating::spawner` for the launch contract.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use socket_handoff::config::{load_config, validate_config, ConfigError, HandoffConfig, PORT_ENV, WORKER_INDEX_ENV};
use socket_handoff::handoff::unix::DescriptorReceiver;
use socket_handoff::observability::logging;
use socket_handoff::{ConnectionListener, DelegatedListenerFactory, HttpServer, ListenerFactory, Shutdown};

#[derive(Parser)]
#[command(name = "handoff-worker")]
#[command(about = "Serve connections handed over by a socket-handoff front process", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control port, overrides `PORT`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Backlog depth, overrides the configuration.
    #[arg(short, long)]
    backlog: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => HandoffConfig::default(),
    };
    if let Some(backlog) = cli.backlog {
        config.delegated.backlog = backlog;
    }
    config.delegated.port = match cli.port.or(config.delegated.port) {
        Some(port) => Some(port),
        None => Some(std::env::var(PORT_ENV)?.parse()?),
    };
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability);

    let index = std::env::var(WORKER_INDEX_ENV).ok();
    tracing::info!(pid = std::process::id(), worker = ?index, "handoff-worker starting");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let reconstructor = DescriptorReceiver::from_env()?;
    let endpoint = SocketAddr::new(config.delegated.bind_ip, config.delegated.port.unwrap_or_default());
    let factory = DelegatedListenerFactory::new(Arc::new(reconstructor)).with_backlog(config.delegated.backlog);
    let listener = Arc::new(factory.bind(endpoint, &shutdown.token()).await?);

    let served = HttpServer::new().run(listener.clone(), shutdown.token()).await;
    listener.dispose().await;
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}
