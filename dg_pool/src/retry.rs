//! ABOUTME: Retry policy with linear backoff and pluggable error classification
//! ABOUTME: Decides whether a failed operation is worth another attempt and how long to wait

use std::time::Duration;

use dg_core::Error;

/// Whether a failure is expected to clear up on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Transient,
    Fatal,
}

/// Maps an error to a retry disposition
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &Error) -> Disposition;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&Error) -> Disposition + Send + Sync,
{
    fn classify(&self, error: &Error) -> Disposition {
        self(error)
    }
}

/// Treats timeouts, resets and unreachable networks as transient
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &Error) -> Disposition {
        use std::io::ErrorKind;

        let transient = match error {
            Error::ConnectTimeout(_) => true,
            Error::ConnectFailed(e) | Error::Backend(e) => e.is_transient(),
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            Error::QueryExecutionFailed { source, .. } => {
                return self.classify(source);
            }
            _ => false,
        };

        if transient {
            Disposition::Transient
        } else {
            Disposition::Fatal
        }
    }
}

/// Linear backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry; the n-th retry waits `base_delay * n`
    pub base_delay: Duration,
    /// Retries allowed when the caller does not pass its own limit
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (starting at 1)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }

    /// Delay before the next attempt, or `None` if the failure should propagate.
    ///
    /// `retries_so_far` counts retries already performed, so the first failure
    /// passes 0.
    pub fn next_delay(
        &self,
        disposition: Disposition,
        retries_so_far: u32,
        max_retries: u32,
    ) -> Option<Duration> {
        if disposition == Disposition::Fatal || retries_so_far >= max_retries {
            return None;
        }
        Some(self.delay_for_attempt(retries_so_far + 1))
    }
}
