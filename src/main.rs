use distserve::config::Config;
use distserve::control::{ControlServer, PKG_NAME, VERSION};
use distserve::manager::LifecycleManager;
use distserve::registry::ServerRegistry;
use distserve::store::ConfigStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("distserve=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    if config_path.exists() {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
    }

    print_startup_banner(&config);

    // Open the directory store
    let store_path = config
        .control
        .store_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_store_path);
    let store = Arc::new(ConfigStore::open(&store_path).map_err(|e| {
        error!(path = %store_path.display(), error = %e, "Failed to open directory store");
        anyhow::anyhow!("failed to open directory store: {}", e)
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Compose the core: explicit registry, injected into the manager
    let registry = Arc::new(ServerRegistry::new());
    let manager = LifecycleManager::new(Arc::clone(&registry), config.lifecycle.clone());

    // Generate or use configured control token
    let control_token = config.control.auth_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated control API token (configure auth_token to set a fixed value)");
        token
    });

    let control_addr: SocketAddr = format!("{}:{}", config.control.bind, config.control.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.control.bind, port = config.control.port, error = %e, "Invalid control bind address");
            anyhow::anyhow!("Invalid control bind address: {}", e)
        })?;

    let control_server = ControlServer::new(
        control_addr,
        Arc::clone(&manager),
        Arc::clone(&store),
        shutdown_rx.clone(),
        control_token,
    );

    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all running servers; failures are logged, not retried — the
    // process is terminating either way
    info!("Stopping all servers...");
    manager.shutdown_all().await;

    // Wait for the control server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn default_store_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("distserve")
        .join("dirs.json")
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting server manager");
    info!(
        bind = %config.control.bind,
        port = config.control.port,
        "Control API configuration"
    );
    info!(
        graceful_close_secs = config.lifecycle.graceful_close_secs,
        settle_delay_ms = config.lifecycle.settle_delay_ms,
        bind_wait_secs = config.lifecycle.bind_wait_secs,
        upstream_timeout_secs = config.lifecycle.upstream_timeout_secs,
        "Lifecycle settings"
    );
}
