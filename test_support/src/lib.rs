//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Scripted connectors and fixtures for exercising the pool in tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dg_core::BackendError;
use dg_pool::{
    CircuitBreakerConfig, Connector, CoolDownPolicy, ManagerConfig, PoolConfig, RetryPolicy,
};

/// In-memory connection handed out by [`ScriptedConnector`]
#[derive(Debug)]
pub struct MockConnection {
    pub serial: u32,
    pub queries: u32,
    live: Arc<AtomicUsize>,
}

impl MockConnection {
    /// Pretend to run a statement; returns how many this connection has run
    pub fn query(&mut self) -> u32 {
        self.queries += 1;
        self.queries
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector whose connect outcomes are scripted by the test.
///
/// Queued failures are consumed first; after that every connect succeeds
/// unless a permanent failure is set.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    queued: Mutex<VecDeque<BackendError>>,
    permanent: Mutex<Option<BackendError>>,
    connect_delay: Mutex<Option<Duration>>,
    attempts: AtomicU32,
    opened: AtomicU32,
    closed: AtomicU32,
    live: Arc<AtomicUsize>,
    peak_live: AtomicUsize,
}

impl ScriptedConnector {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Every connect fails with `error` until [`recover`](Self::recover) is called
    pub fn failing(error: BackendError) -> Self {
        let connector = Self::default();
        connector.fail_with(error);
        connector
    }

    pub fn fail_with(&self, error: BackendError) {
        *self.permanent.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.permanent.lock().unwrap() = None;
    }

    /// Queue `count` failures ahead of the normal outcome
    pub fn queue_failures(&self, count: usize, error: BackendError) {
        let mut queued = self.queued.lock().unwrap();
        for _ in 0..count {
            queued.push_back(error.clone());
        }
    }

    /// Make every connect take `delay` before resolving
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Connect calls made, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections currently alive (opened and not yet dropped)
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, BackendError> {
        let serial = self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queued.lock().unwrap().pop_front();
        if let Some(err) = queued {
            return Err(err);
        }
        let permanent = self.permanent.lock().unwrap().clone();
        if let Some(err) = permanent {
            return Err(err);
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(MockConnection {
            serial,
            queries: 0,
            live: Arc::clone(&self.live),
        })
    }

    async fn close(&self, conn: MockConnection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Manager config with the reference breaker values and short timeouts
pub fn test_manager_config(max_size: u32) -> ManagerConfig {
    ManagerConfig {
        pool: PoolConfig {
            max_size,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_millis(30_000),
            policy: CoolDownPolicy::Fixed,
        },
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_retries: 2,
        },
    }
}
