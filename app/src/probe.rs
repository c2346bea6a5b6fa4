//! ABOUTME: Periodic liveness probe that runs SELECT 1 through the connection manager
//! ABOUTME: Keeps breaker state fresh so readiness reflects the store even when idle

use std::time::Duration;

use dg_core::{Error, Result};
use dg_pool::backend_error_from_sqlx;
use futures_util::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SqliteManager;

/// Run a single `SELECT 1` with the manager's default retry budget
pub async fn probe_once(manager: &SqliteManager, token: &CancellationToken) -> Result<i64> {
    let max_retries = manager.retry_policy().max_retries;
    manager
        .with_connection_cancellable(max_retries, token, |conn| {
            async move {
                sqlx::query_scalar::<_, i64>("SELECT 1")
                    .fetch_one(conn)
                    .await
                    .map_err(|e| Error::from(backend_error_from_sqlx(e)))
            }
            .boxed()
        })
        .await
}

/// Probe every `interval` until `token` is cancelled
pub async fn run_probe(manager: SqliteManager, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "Liveness probe started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match probe_once(&manager, &token).await {
            Ok(_) => debug!("Liveness probe succeeded"),
            Err(Error::Cancelled) => break,
            Err(e) => {
                let state = manager.get_state();
                warn!(
                    category = %e.category(),
                    error = %e,
                    failure_count = state.failure_count,
                    circuit_state = %state.circuit_state,
                    "Liveness probe failed"
                );
            }
        }
    }

    info!("Liveness probe stopped");
}
