use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use admission_control::admission::LimitsFile;
use admission_control::clock::SystemClock;
use admission_control::config::ServiceConfig;
use admission_control::http::HttpServer;
use admission_control::service::AdmissionService;

/// Rate limiting and request queueing service.
#[derive(Debug, Parser)]
#[command(name = "admission-control", version, about)]
struct Cli {
    /// Path to a YAML/TOML/JSON config file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// YAML file of default and per-identifier limits
    #[arg(long)]
    limits: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if cli.limits.is_some() {
        config.limits_path = cli.limits;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        drain_interval_ms = config.engine.drain_interval_ms,
        "Configuration loaded"
    );

    let service = Arc::new(AdmissionService::in_memory(
        Arc::new(SystemClock),
        config.engine.average_service(),
    ));

    if let Some(path) = &config.limits_path {
        let file = LimitsFile::from_file(path)?;
        let seeded = service.registry().seed(file).await?;
        info!(path = %path, limits = seeded, "Limits seeded");
    }

    let shutdown = CancellationToken::new();
    let drain = service
        .scheduler()
        .clone()
        .spawn(config.engine.drain_interval(), shutdown.clone());

    let server = HttpServer::new(config.server.listen_addr, service);
    info!("Starting HTTP server on {}", config.server.listen_addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    shutdown.cancel();
    drain.await?;

    info!("Admission Control Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
