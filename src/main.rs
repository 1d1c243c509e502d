use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::admission::spawn_sweeper;
use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::web::{AdmissionLayer, AdmissionOptions, HttpServer, TracingSink};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "HTTP server with per-client request admission", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Admission window in milliseconds, overriding the configuration file
    #[arg(long)]
    window_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    if let Some(window_ms) = args.window_ms {
        config.admission.window_ms = window_ms;
    }

    init_tracing(&config.logging);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        window_ms = config.admission.window_ms,
        client_key = ?config.admission.client_key,
        "Configuration loaded"
    );

    // Initialize the admission layer
    let options = AdmissionOptions {
        window: config.admission.window(),
        key_extractor: config.admission.key_extractor()?,
        log_sink: Arc::new(TracingSink),
    };
    let layer = AdmissionLayer::new(options);
    let sweeper = config.admission.eviction.as_ref().map(|eviction| {
        spawn_sweeper(
            Arc::clone(layer.filter()),
            eviction.interval(),
            eviction.idle_after(),
        )
    });

    // Run the server with graceful shutdown on Ctrl+C
    HttpServer::new(config.server.http_addr, layer)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Gatekeeper stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
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
