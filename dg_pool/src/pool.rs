//! ABOUTME: Bounded resource pool of backing-store connections
//! ABOUTME: Grants exclusive handles, reclaims them on every exit path, and emits lifecycle events

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dg_core::{ConnectionId, Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connector::Connector;

/// Configuration for the resource pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections held at once
    pub max_size: u32,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// Upper bound on waiting for a free slot plus opening a connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle signals raised by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new physical connection was opened
    Connect { id: ConnectionId },
    /// An acquisition attempt failed or timed out
    Error { message: String },
    /// A handle was granted to a caller
    Acquire { id: ConnectionId },
    /// A handle came back to the pool
    Release { id: ConnectionId },
    /// The number of idle connections changed
    Idle { count: usize },
}

/// Receives pool lifecycle events. Called inline, so implementations must not block.
pub trait PoolEventListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}

struct NoopListener;

impl PoolEventListener for NoopListener {
    fn on_event(&self, _event: &PoolEvent) {}
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub max_size: u32,
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct IdleConnection<T> {
    conn: T,
    id: ConnectionId,
    created_at: Instant,
    idle_since: Instant,
    use_count: u64,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    /// Discarded connections waiting to be closed by the next checkout
    discarded: Mutex<Vec<C::Connection>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    listener: Arc<dyn PoolEventListener>,
}

impl<C: Connector> PoolInner<C> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<C::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_discarded(&self) -> Vec<C::Connection> {
        let mut discarded = self.discarded.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *discarded)
    }

    fn emit(&self, event: PoolEvent) {
        self.listener.on_event(&event);
    }

    /// Pop the most recently used live connection, splitting off expired ones.
    /// Also returns how many idle connections remain.
    fn take_idle(
        &self,
    ) -> (
        Option<IdleConnection<C::Connection>>,
        Vec<IdleConnection<C::Connection>>,
        usize,
    ) {
        let mut idle = self.lock_idle();
        let mut expired = Vec::new();

        while let Some(front) = idle.front() {
            if front.idle_since.elapsed() < self.config.idle_timeout {
                break;
            }
            if let Some(stale) = idle.pop_front() {
                expired.push(stale);
            }
        }

        let reusable = idle.pop_back();
        (reusable, expired, idle.len())
    }
}

/// Bounded pool of connections produced by a [`Connector`]
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.inner.connector.describe())
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool that does not report lifecycle events
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self::with_listener(connector, config, Arc::new(NoopListener))
    }

    /// Create a pool that reports lifecycle events to `listener`
    pub fn with_listener(
        connector: C,
        config: PoolConfig,
        listener: Arc<dyn PoolEventListener>,
    ) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                semaphore: Arc::new(Semaphore::new(max_size as usize)),
                idle: Mutex::new(VecDeque::with_capacity(max_size as usize)),
                discarded: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                listener,
                config: PoolConfig { max_size, ..config },
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Acquire a connection, waiting at most the configured connect timeout
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        self.acquire_timeout(self.inner.config.connect_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout` for a slot and a connect.
    ///
    /// If the timeout elapses mid-connect the half-open connection and the slot
    /// are both dropped before returning.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(Error::PoolClosed)) => Err(Error::PoolClosed),
            Ok(Err(e)) => {
                self.inner.emit(PoolEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
            Err(_) => {
                let err = Error::ConnectTimeout(timeout);
                debug!(
                    backend = %self.inner.connector.describe(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for a pooled connection"
                );
                self.inner.emit(PoolEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn checkout(&self) -> Result<PooledConnection<C>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let (reusable, expired, remaining) = self.inner.take_idle();
        if reusable.is_some() || !expired.is_empty() {
            self.inner.emit(PoolEvent::Idle { count: remaining });
        }
        for conn in self.inner.take_discarded() {
            self.inner.connector.close(conn).await;
        }
        for stale in expired {
            debug!(
                connection_id = %stale.id,
                use_count = stale.use_count,
                "Closing connection past idle timeout"
            );
            self.inner.connector.close(stale.conn).await;
        }

        let entry = match reusable {
            Some(entry) => entry,
            None => {
                let conn = self
                    .inner
                    .connector
                    .connect()
                    .await
                    .map_err(Error::ConnectFailed)?;
                let id = ConnectionId::new();
                let now = Instant::now();

                debug!(
                    connection_id = %id,
                    backend = %self.inner.connector.describe(),
                    "Opened new connection"
                );
                self.inner.emit(PoolEvent::Connect { id });

                IdleConnection {
                    conn,
                    id,
                    created_at: now,
                    idle_since: now,
                    use_count: 0,
                }
            }
        };

        Ok(PooledConnection::checked_out(
            entry,
            permit,
            Arc::clone(&self.inner),
        ))
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.lock_idle().len();
        let in_use = self.inner.in_use.load(Ordering::Acquire);
        PoolStatus {
            max_size: self.inner.config.max_size,
            size: idle + in_use,
            idle,
            in_use,
        }
    }

    /// Stop granting handles, wait for outstanding ones, then close every connection
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let outstanding = self.inner.in_use.load(Ordering::Acquire);
        info!(
            backend = %self.inner.connector.describe(),
            outstanding,
            "Shutting down connection pool"
        );

        // Holding every permit means every handle has been released
        match self
            .inner
            .semaphore
            .acquire_many(self.inner.config.max_size)
            .await
        {
            Ok(all) => drop(all),
            Err(_) => warn!("Pool semaphore closed before drain completed"),
        }
        self.inner.semaphore.close();

        let drained: Vec<_> = self.inner.lock_idle().drain(..).collect();
        if !drained.is_empty() {
            self.inner.emit(PoolEvent::Idle { count: 0 });
        }
        let discarded = self.inner.take_discarded();
        let closed = drained.len() + discarded.len();
        for entry in drained {
            self.inner.connector.close(entry.conn).await;
        }
        for conn in discarded {
            self.inner.connector.close(conn).await;
        }

        info!(closed, "Connection pool shut down");
    }
}

/// Exclusive handle to a pooled connection.
///
/// Dereferences to the underlying connection. Call [`release`](Self::release)
/// to hand it back; if the handle is dropped instead (early return, panic,
/// cancelled future) it is released by `Drop`. Release consumes the handle,
/// so a second release cannot be expressed.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    id: ConnectionId,
    created_at: Instant,
    use_count: u64,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> PooledConnection<C> {
    fn checked_out(
        entry: IdleConnection<C::Connection>,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner<C>>,
    ) -> Self {
        pool.in_use.fetch_add(1, Ordering::AcqRel);
        pool.emit(PoolEvent::Acquire { id: entry.id });

        Self {
            conn: Some(entry.conn),
            id: entry.id,
            created_at: entry.created_at,
            use_count: entry.use_count + 1,
            permit: Some(permit),
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// How many times this physical connection has been checked out
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Return the connection to the pool for reuse
    pub fn release(mut self) {
        self.give_back(true);
    }

    /// Release the slot but close the connection instead of pooling it.
    ///
    /// The close runs on the next checkout, or at shutdown.
    pub fn discard(mut self) {
        self.give_back(false);
    }

    fn give_back(&mut self, reuse: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if reuse {
            let count = {
                let mut idle = self.pool.lock_idle();
                idle.push_back(IdleConnection {
                    conn,
                    id: self.id,
                    created_at: self.created_at,
                    idle_since: Instant::now(),
                    use_count: self.use_count,
                });
                idle.len()
            };
            self.pool.emit(PoolEvent::Idle { count });
        } else {
            debug!(connection_id = %self.id, "Discarding connection");
            self.pool
                .discarded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn);
        }

        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
        self.pool.emit(PoolEvent::Release { id: self.id });

        // The slot frees last so the next waiter finds the idle connection
        drop(self.permit.take());
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is present until the handle is released")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is present until the handle is released")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.give_back(true);
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("use_count", &self.use_count)
            .finish()
    }
}
