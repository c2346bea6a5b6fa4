//! ABOUTME: Connection pool and circuit breaker metrics
//! ABOUTME: Provides Prometheus metrics for pool performance monitoring

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;

/// Metrics for connection pool operations
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Total number of successful connection acquisitions
    pub connections_acquired: Counter,
    /// Total number of failed connection acquisitions
    pub connections_failed: Counter,
    /// Total number of connection acquisition timeouts
    pub connections_timeout: Counter,
    /// Acquisitions refused by the open circuit breaker
    pub connections_rejected: Counter,
    /// Total number of operation retries
    pub operation_retries: Counter,
    /// Current number of idle connections in pool
    pub connections_idle: Gauge,
    /// Current number of handed-out connections
    pub connections_active: Gauge,
    /// Total number of circuit breaker trips
    pub circuit_breaker_trips: Counter,
    /// Current circuit breaker state (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: Gauge,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every metric under the `dbguard_pool` prefix
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("dbguard_pool");
        registry.register(
            "connections_acquired",
            "Successful connection acquisitions",
            self.connections_acquired.clone(),
        );
        registry.register(
            "connections_failed",
            "Failed connection acquisitions",
            self.connections_failed.clone(),
        );
        registry.register(
            "connections_timeout",
            "Connection acquisitions that timed out",
            self.connections_timeout.clone(),
        );
        registry.register(
            "connections_rejected",
            "Acquisitions refused by the open circuit breaker",
            self.connections_rejected.clone(),
        );
        registry.register(
            "operation_retries",
            "Operation retries after transient failures",
            self.operation_retries.clone(),
        );
        registry.register(
            "connections_idle",
            "Idle connections in the pool",
            self.connections_idle.clone(),
        );
        registry.register(
            "connections_active",
            "Connections currently handed out",
            self.connections_active.clone(),
        );
        registry.register(
            "circuit_breaker_trips",
            "Times the circuit breaker opened",
            self.circuit_breaker_trips.clone(),
        );
        registry.register(
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            self.circuit_breaker_state.clone(),
        );
    }

    pub fn record_acquired(&self) {
        self.connections_acquired.inc();
    }

    pub fn record_failed(&self) {
        self.connections_failed.inc();
    }

    pub fn record_timeout(&self) {
        self.connections_timeout.inc();
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.inc();
    }

    pub fn record_retry(&self) {
        self.operation_retries.inc();
    }

    pub fn set_idle(&self, count: i64) {
        self.connections_idle.set(count);
    }

    pub fn set_active(&self, count: i64) {
        self.connections_active.set(count);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.inc();
    }

    /// Set circuit breaker state (0=closed, 1=open, 2=half-open)
    pub fn set_circuit_breaker_state(&self, state: i64) {
        self.circuit_breaker_state.set(state);
    }
}
