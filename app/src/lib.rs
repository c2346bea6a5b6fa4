//! ABOUTME: Service wiring for dbguard: one shared manager, a liveness probe and metrics
//! ABOUTME: Kept in a library so the end-to-end tests can assemble the same pieces

pub mod probe;

use std::sync::Arc;

use dg_config::Config;
use dg_core::Result;
use dg_pool::{ConnectionManager, PoolMetrics, SqliteConnector};

pub use probe::{probe_once, run_probe};

pub type SqliteManager = ConnectionManager<SqliteConnector>;

/// Build the process-wide manager and the metrics it records into
pub fn build_manager(config: &Config) -> Result<(SqliteManager, Arc<PoolMetrics>)> {
    let connector = SqliteConnector::from_url(&config.database.url)?;
    let metrics = Arc::new(PoolMetrics::new());
    let manager =
        ConnectionManager::with_metrics(connector, config.manager_config(), Arc::clone(&metrics));
    Ok((manager, metrics))
}
