//! Front process: accepts public connections and delegates some of them.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────── FRONT ────────────────────┐
//!   Client ──────────▶│ DelegatingListener ──▶ RoutingPolicy          │
//!                     │        │                  │                   │
//!                     │        │ Local            │ Worker(i)         │
//!                     │        ▼                  ▼                   │
//!                     │   HttpServer      WorkerSupervisor[i]         │
//!                     │                     │ duplicate  │ frame      │
//!                     └─────────────────────┼────────────┼────────────┘
//!                                descriptor │            │ control (TCP)
//!                     ┌─────────────────────▼────────────▼────────────┐
//!                     │ DelegatedListener ──▶ backlog ──▶ HttpServer  │
//!                     └──────────────────── WORKER i ─────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use socket_handoff::config::{load_config, validate_config, ConfigError, HandoffConfig};
use socket_handoff::observability::{logging, metrics};
use socket_handoff::{routing, ConnectionListener, DelegatingListenerFactory, HttpServer, ListenerFactory, Shutdown};

const WORKER_BINARY: &str = "handoff-worker";

#[derive(Parser)]
#[command(name = "socket-handoff")]
#[command(about = "Accept connections and hand some of them to worker processes", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Public bind address, overrides the configuration.
    #[arg(short, long)]
    listen: Option<String>,

    /// Worker executable, overrides the configuration.
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// Number of workers, overrides the configuration.
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => HandoffConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some(count) = cli.workers {
        config.workers.count = count;
    }
    config.workers.program = cli
        .worker_program
        .unwrap_or_else(|| resolve_worker_program(config.workers.program.clone()));
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability);
    tracing::info!(pid = std::process::id(), "socket-handoff v0.1.0 starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        workers = config.workers.count,
        program = %config.workers.program.display(),
        policy = ?config.routing.policy,
        "Configuration loaded"
    );

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let endpoint: SocketAddr = config.listener.bind_address.parse()?;
    let factory = DelegatingListenerFactory::new(config.workers.clone(), routing::from_kind(config.routing.policy));
    let listener = Arc::new(factory.bind(endpoint, &shutdown.token()).await?);

    let served = HttpServer::new().run(listener.clone(), shutdown.token()).await;
    listener.dispose().await;
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Prefer a worker binary installed next to this one when the configured
/// program is the bare default name.
fn resolve_worker_program(program: PathBuf) -> PathBuf {
    if program != PathBuf::from(WORKER_BINARY) {
        return program;
    }
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(WORKER_BINARY))
        .filter(|sibling| sibling.is_file())
        .unwrap_or(program)
}
