//! ABOUTME: Connection manager composing the pool, circuit breaker and retry policy
//! ABOUTME: The single entry point callers use to acquire connections or run operations

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use dg_core::{to_rfc3339, utc_now, BackendError, BackendErrorKind, Error, Result};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::connector::Connector;
use crate::metrics::PoolMetrics;
use crate::pool::{Pool, PoolConfig, PoolEvent, PoolEventListener, PoolStatus, PooledConnection};
use crate::retry::{DefaultClassifier, ErrorClassifier, RetryPolicy};

/// Configuration for the connection manager
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub pool: PoolConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

/// Read-only copy of the manager state, for health checks and monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStateSnapshot {
    pub failure_count: u32,
    pub circuit_open: bool,
    pub circuit_state: CircuitState,
    pub is_connected: bool,
    pub current_connections: u64,
    pub max_connections: u64,
    pub total_errors: u64,
    pub last_error_message: Option<String>,
    /// RFC3339 time of the most recent acquisition failure
    pub last_failure_at: Option<String>,
    pub breaker_trips: u64,
    pub pool: PoolStatus,
}

/// Anything that can report a manager state snapshot
pub trait StateSource: Send + Sync {
    fn snapshot(&self) -> ManagerStateSnapshot;
}

#[derive(Debug)]
struct ManagerState {
    breaker: CircuitBreaker,
    is_connected: bool,
    current_connections: u64,
    max_connections: u64,
    total_errors: u64,
    last_error_message: Option<String>,
    last_failure_at: Option<SystemTime>,
}

/// State shared between the manager and the pool's event listener
#[derive(Debug)]
struct Shared {
    state: Mutex<ManagerState>,
    metrics: Arc<PoolMetrics>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_breaker_state(&self, state: &ManagerState, now: Instant) {
        self.metrics
            .set_circuit_breaker_state(state.breaker.state(now).to_metric_value());
    }
}

impl PoolEventListener for Shared {
    fn on_event(&self, event: &PoolEvent) {
        if let PoolEvent::Idle { count } = event {
            self.metrics.set_idle(*count as i64);
            return;
        }

        let mut state = self.lock();
        match event {
            PoolEvent::Connect { id } => {
                debug!(connection_id = %id, "Connected to backing store");
                state.is_connected = true;
                state.breaker.record_connect();
            }
            PoolEvent::Error { message } => {
                state.total_errors += 1;
                state.last_error_message = Some(message.clone());
            }
            PoolEvent::Acquire { .. } => {
                state.current_connections += 1;
                state.max_connections = state.max_connections.max(state.current_connections);
                self.metrics.set_active(state.current_connections as i64);
            }
            PoolEvent::Release { .. } => {
                state.current_connections = state.current_connections.saturating_sub(1);
                self.metrics.set_active(state.current_connections as i64);
            }
            PoolEvent::Idle { .. } => {}
        }
    }
}

/// Releases the probe slot if an admitted probe is dropped before it resolves
struct ProbeGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().breaker.abandon_probe(Instant::now());
        }
    }
}

/// Brokers access to the backing store.
///
/// Construct one at startup and share it; clones refer to the same pool and
/// state.
pub struct ConnectionManager<C: Connector> {
    pool: Pool<C>,
    shared: Arc<Shared>,
    retry: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            shared: Arc::clone(&self.shared),
            retry: self.retry.clone(),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager with its own metrics
    pub fn new(connector: C, config: ManagerConfig) -> Self {
        Self::with_metrics(connector, config, Arc::new(PoolMetrics::new()))
    }

    /// Create a manager that records into the given metrics
    pub fn with_metrics(connector: C, config: ManagerConfig, metrics: Arc<PoolMetrics>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState {
                breaker: CircuitBreaker::new(config.breaker),
                is_connected: false,
                current_connections: 0,
                max_connections: 0,
                total_errors: 0,
                last_error_message: None,
                last_failure_at: None,
            }),
            metrics,
        });

        let listener: Arc<dyn PoolEventListener> = shared.clone();
        let pool = Pool::with_listener(connector, config.pool, listener);

        Self {
            pool,
            shared,
            retry: config.retry,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    /// Replace the error classifier used by the retry loop
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.shared.metrics
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Acquire a connection through the circuit breaker.
    ///
    /// Fails with `ResourceUnavailable` without touching the pool while the
    /// breaker is open. Pool failures update the failure bookkeeping and come
    /// back as `ConnectFailed` or `ConnectTimeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let admission = {
            let mut state = self.shared.lock();
            let now = Instant::now();
            match state.breaker.admit(now) {
                Ok(admission) => {
                    self.shared.publish_breaker_state(&state, now);
                    admission
                }
                Err(retry_after) => {
                    drop(state);
                    self.shared.metrics.record_rejected();
                    debug!(
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Acquisition rejected by open circuit breaker"
                    );
                    return Err(Error::ResourceUnavailable { retry_after });
                }
            }
        };

        let mut probe = ProbeGuard {
            shared: &self.shared,
            armed: admission == Admission::Probe,
        };
        let result = self.pool.acquire().await;
        probe.disarm();

        let now = Instant::now();
        match result {
            Ok(conn) => {
                {
                    let mut state = self.shared.lock();
                    state.is_connected = true;
                    state.breaker.record_success();
                    self.shared.publish_breaker_state(&state, now);
                }
                self.shared.metrics.record_acquired();
                Ok(conn)
            }
            Err(Error::PoolClosed) => {
                if admission == Admission::Probe {
                    self.shared.lock().breaker.abandon_probe(now);
                }
                Err(Error::PoolClosed)
            }
            Err(e) => {
                let opened = {
                    let mut state = self.shared.lock();
                    state.last_failure_at = Some(utc_now());
                    let opened = match admission {
                        Admission::Probe => state.breaker.record_probe_failure(now),
                        Admission::Closed => state.breaker.record_failure(now),
                    };
                    self.shared.publish_breaker_state(&state, now);
                    opened
                };

                self.shared.metrics.record_failed();
                if matches!(e, Error::ConnectTimeout(_)) {
                    self.shared.metrics.record_timeout();
                }
                if opened {
                    self.shared.metrics.record_circuit_breaker_trip();
                }

                let probing = admission == Admission::Probe;
                warn!(error = %e, probing, "Connection acquisition failed");

                Err(match e {
                    Error::ConnectFailed(_) | Error::ConnectTimeout(_) => e,
                    other => Error::ConnectFailed(BackendError::new(
                        BackendErrorKind::Other,
                        other.to_string(),
                    )),
                })
            }
        }
    }

    /// Run `op` with a pooled connection, retrying transient failures up to
    /// the configured default number of times.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dg_pool::{ConnectionManager, ManagerConfig, SqliteConnector};
    /// use futures_util::FutureExt;
    ///
    /// # async fn run() -> dg_core::Result<()> {
    /// let connector = SqliteConnector::from_url("sqlite::memory:")?;
    /// let manager = ConnectionManager::new(connector, ManagerConfig::default());
    ///
    /// let one: i64 = manager
    ///     .with_connection(|conn| {
    ///         async move {
    ///             sqlx::query_scalar::<_, i64>("SELECT 1")
    ///                 .fetch_one(conn)
    ///                 .await
    ///                 .map_err(|e| dg_core::Error::from(dg_pool::backend_error_from_sqlx(e)))
    ///         }
    ///         .boxed()
    ///     })
    ///     .await?;
    /// assert_eq!(one, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut C::Connection) -> BoxFuture<'_, Result<T>> + Send,
    {
        self.run(self.retry.max_retries, None, op).await
    }

    /// Like [`with_connection`](Self::with_connection) with an explicit retry bound.
    /// `max_retries = 0` means a single attempt.
    pub async fn with_retries<T, F>(&self, max_retries: u32, op: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut C::Connection) -> BoxFuture<'_, Result<T>> + Send,
    {
        self.run(max_retries, None, op).await
    }

    /// Like [`with_retries`](Self::with_retries), aborting with `Cancelled` as
    /// soon as `token` fires, including mid-operation and mid-backoff.
    pub async fn with_connection_cancellable<T, F>(
        &self,
        max_retries: u32,
        token: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut C::Connection) -> BoxFuture<'_, Result<T>> + Send,
    {
        self.run(max_retries, Some(token), op).await
    }

    async fn run<T, F>(
        &self,
        max_retries: u32,
        token: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut C::Connection) -> BoxFuture<'_, Result<T>> + Send,
    {
        {
            let state = self.shared.lock();
            if let Err(retry_after) = state.breaker.check(Instant::now()) {
                drop(state);
                self.shared.metrics.record_rejected();
                return Err(Error::ResourceUnavailable { retry_after });
            }
        }

        let mut retries: u32 = 0;
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            match until_cancelled(token, self.attempt_once(&mut op)).await {
                Ok(value) => {
                    if retries > 0 {
                        info!(attempts = retries + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(
                    e @ (Error::ResourceUnavailable { .. } | Error::Cancelled | Error::PoolClosed),
                ) => {
                    return Err(e);
                }
                Err(e) => {
                    let disposition = self.classifier.classify(&e);
                    match self.retry.next_delay(disposition, retries, max_retries) {
                        Some(delay) => {
                            self.shared.metrics.record_retry();
                            debug!(
                                attempt = retries + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Operation failed, retrying after delay"
                            );
                            until_cancelled(token, async {
                                tokio::time::sleep(delay).await;
                                Ok(())
                            })
                            .await?;
                            retries += 1;
                        }
                        None => {
                            warn!(
                                attempts = retries + 1,
                                ?disposition,
                                error = %e,
                                "Operation failed, giving up"
                            );
                            return Err(Error::QueryExecutionFailed {
                                attempts: retries + 1,
                                source: Box::new(e),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn attempt_once<T, F>(&self, op: &mut F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut C::Connection) -> BoxFuture<'_, Result<T>> + Send,
    {
        let mut conn = self.acquire().await?;
        let result = op(&mut *conn).await;

        match &result {
            Err(Error::Backend(e)) if e.kind == BackendErrorKind::ConnectionReset => conn.discard(),
            _ => conn.release(),
        }
        result
    }

    /// Read-only snapshot of the manager state
    pub fn get_state(&self) -> ManagerStateSnapshot {
        let pool = self.pool.status();
        let state = self.shared.lock();
        let circuit_state = state.breaker.state(Instant::now());

        ManagerStateSnapshot {
            failure_count: state.breaker.failure_count(),
            circuit_open: circuit_state == CircuitState::Open,
            circuit_state,
            is_connected: state.is_connected,
            current_connections: state.current_connections,
            max_connections: state.max_connections,
            total_errors: state.total_errors,
            last_error_message: state.last_error_message.clone(),
            last_failure_at: state.last_failure_at.map(to_rfc3339),
            breaker_trips: state.breaker.trips(),
            pool,
        }
    }

    /// Drain outstanding handles and close every connection
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

impl<C: Connector> StateSource for ConnectionManager<C> {
    fn snapshot(&self) -> ManagerStateSnapshot {
        self.get_state()
    }
}

async fn until_cancelled<T>(
    token: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}
