//! ABOUTME: Core types, errors, IDs, and tracing utilities
//! ABOUTME: Foundation crate used by all other dbguard components

pub mod error;
pub mod id;
pub mod telemetry;
pub mod time;

pub use error::{BackendError, BackendErrorKind, Error, ErrorCategory, Result};
pub use id::ConnectionId;
pub use time::{to_rfc3339, utc_now};
