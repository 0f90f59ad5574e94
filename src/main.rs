use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreKind, TurnstileConfig};
use turnstile::mesh::Cluster;
use turnstile::middleware::RateLimitMiddleware;
use turnstile::ratelimit::AdmissionController;
use turnstile::server::AdmissionServer;
use turnstile::store::{BucketStore, ClusterStore, MemoryStore};

/// Fixed-window admission control service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the admission service listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

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

    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    let limits = &config.rate_limiting;
    info!(
        listen_addr = %config.server.listen_addr,
        max_requests = limits.policy().max_requests(),
        window_secs = limits.policy().window_secs(),
        store = ?limits.store,
        "Configuration loaded"
    );

    let mut cluster: Option<Arc<Cluster>> = None;
    let mut sweeper = None;
    let store: Arc<dyn BucketStore> = match limits.store {
        StoreKind::Memory => {
            let store = Arc::new(MemoryStore::new());
            sweeper = Some(store.clone().spawn_sweeper(limits.sweep_interval()));
            store
        }
        StoreKind::Cluster => {
            let node = Arc::new(Cluster::start(config.cluster.to_cluster_config()).await?);
            cluster = Some(node.clone());
            let store = Arc::new(ClusterStore::new(node));
            sweeper = Some(store.clone().spawn_reaper(limits.sweep_interval()));
            store
        }
    };

    let controller = AdmissionController::new(store, limits.policy())
        .with_atomic_increment(limits.atomic_increment)
        .with_store_timeout(limits.store_timeout());
    info!(
        atomic_increment = controller.uses_atomic_increment(),
        "Admission controller initialized"
    );

    let middleware = RateLimitMiddleware::new(Arc::new(controller))
        .with_store_failure_policy(limits.on_store_failure);

    let server = AdmissionServer::bind(config.server.listen_addr, Arc::new(middleware)).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
        let _ = sweeper.await;
    }
    if let Some(cluster) = cluster {
        // The store (and its clone of the handle) is gone once the server returns.
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => info!("Cluster handle still shared, skipping graceful leave"),
        }
    }

    info!("Turnstile Admission Service stopped");
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
