//! ABOUTME: Connector abstraction that opens raw connections to the backing store
//! ABOUTME: Includes the sqlx-backed SQLite connector used by the binary

use std::str::FromStr;

use async_trait::async_trait;
use dg_core::{BackendError, BackendErrorKind};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use tracing::debug;

/// Opens and closes physical connections for the pool.
///
/// The pool treats `Connection` as an opaque handle; the wire protocol lives
/// entirely behind this trait.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new physical connection
    async fn connect(&self) -> Result<Self::Connection, BackendError>;

    /// Close a connection that is leaving the pool
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Credential-free description of the target, for logs
    fn describe(&self) -> String;
}

/// SQLite connector built on sqlx
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
    target: String,
}

impl SqliteConnector {
    /// Build a connector from a DSN such as `sqlite://data.db` or `sqlite::memory:`
    pub fn from_url(url: &str) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend_error_from_sqlx)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let target = options.get_filename().display().to_string();

        Ok(Self { options, target })
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<Self::Connection, BackendError> {
        self.options
            .connect()
            .await
            .map_err(backend_error_from_sqlx)
    }

    async fn close(&self, conn: Self::Connection) {
        if let Err(e) = conn.close().await {
            debug!(backend = %self.target, error = %e, "Error while closing sqlite connection");
        }
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.target)
    }
}

/// Map a sqlx error onto the structured backend error kinds
pub fn backend_error_from_sqlx(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Io(e) => e.into(),
        sqlx::Error::PoolTimedOut => BackendError::timeout("sqlx pool timed out"),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            BackendError::connection_reset(err.to_string())
        }
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6) clear up on their own
            let busy = matches!(db.code().as_deref(), Some("5") | Some("6"));
            let kind = if busy {
                BackendErrorKind::Timeout
            } else {
                BackendErrorKind::Query
            };
            BackendError::new(kind, db.message().to_string())
        }
        sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => {
            BackendError::new(BackendErrorKind::Other, err.to_string())
        }
        other => BackendError::query(other.to_string()),
    }
}
