//! ABOUTME: Resilient pooled-connection manager with circuit breaker and retries
//! ABOUTME: Brokers all access to the backing store through a bounded pool

pub mod circuit_breaker;
pub mod connector;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState, CoolDownPolicy,
};
pub use connector::{backend_error_from_sqlx, Connector, SqliteConnector};
pub use manager::{ConnectionManager, ManagerConfig, ManagerStateSnapshot, StateSource};
pub use metrics::PoolMetrics;
pub use pool::{Pool, PoolConfig, PoolEvent, PoolEventListener, PoolStatus, PooledConnection};
pub use retry::{DefaultClassifier, Disposition, ErrorClassifier, RetryPolicy};
