use clap::Parser;
use dg_config::{redact_dsn, Config};
use dg_core::telemetry;
use dg_obs::ObsState;
use dg_pool::StateSource;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Resilient pooled-connection manager with health and metrics endpoints
#[derive(Debug, Parser)]
#[command(name = "dbguard", version, about)]
struct Cli {
    /// Configuration file to use instead of ./dbguard.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            telemetry::init_tracing("development", "dbguard");
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    telemetry::init_tracing(&config.observability.environment, "dbguard");
    tracing::debug!(?config, "Configuration loaded successfully");

    let (manager, pool_metrics) = match dbguard::build_manager(&config) {
        Ok(built) => built,
        Err(e) => {
            tracing::error!("Failed to create connection manager: {}", e);
            process::exit(1);
        }
    };

    tracing::info!(
        database = %redact_dsn(&config.database.url),
        max_pool_size = config.database.max_pool_size,
        obs_addr = %config.observability_addr(),
        "dbguard configured and ready"
    );

    let source: Arc<dyn StateSource> = Arc::new(manager.clone());
    let obs_state = ObsState::new(source, &pool_metrics);

    let server = match dg_obs::bind_server(&config.observability_addr(), obs_state.clone()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start observability server: {}", e);
            process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let probe = tokio::spawn(dbguard::run_probe(
        manager.clone(),
        config.probe_interval(),
        token.clone(),
    ));

    // The server handles SIGINT/SIGTERM and returns once it has stopped
    let result = server.await;

    obs_state.readiness.set_ready(false);
    token.cancel();
    if let Err(e) = probe.await {
        tracing::warn!("Liveness probe task failed: {}", e);
    }
    manager.shutdown().await;
    tracing::info!(state = ?manager.get_state(), "dbguard stopped");

    if let Err(e) = result {
        tracing::error!("Server error: {}", e);
        process::exit(1);
    }
}
