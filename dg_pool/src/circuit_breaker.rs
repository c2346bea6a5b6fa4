//! ABOUTME: Circuit breaker state machine guarding connection acquisition
//! ABOUTME: Opens after consecutive failures and admits a single probe once the cool-down expires

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting acquisitions until the cool-down expires
    Open,
    /// Cool-down expired; the next acquisition (or one already in flight) is a probe
    HalfOpen,
}

impl CircuitState {
    /// Convert to metric value (0=closed, 1=open, 2=half-open)
    pub fn to_metric_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How failures recorded while the breaker is already open affect the cool-down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoolDownPolicy {
    /// The deadline is fixed when the breaker opens
    #[default]
    Fixed,
    /// Each failure while open pushes the deadline out by a full cool-down
    ExtendOnFailure,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive acquisition failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker rejects acquisitions once open
    pub cool_down: Duration,
    pub policy: CoolDownPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(30),
            policy: CoolDownPolicy::Fixed,
        }
    }
}

/// Outcome of asking the breaker for permission to contact the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, proceed normally
    Closed,
    /// Caller holds the single probe slot; report its outcome
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open { until: Instant },
    Probing,
}

/// Circuit breaker for backing-store acquisitions.
///
/// Holds no lock of its own; the connection manager keeps it inside the
/// shared state mutex so every transition sees a consistent record. Every
/// method takes `now` explicitly.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    phase: Phase,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            phase: Phase::Closed,
            failure_count: 0,
            last_failure_time: None,
            trips: 0,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        match self.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { until } if now < until => CircuitState::Open,
            Phase::Open { .. } | Phase::Probing => CircuitState::HalfOpen,
        }
    }

    /// Open and still inside the cool-down window
    pub fn is_open(&self, now: Instant) -> bool {
        self.state(now) == CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    /// Number of times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.trips
    }

    /// Reject without changing state if a call now would be refused.
    ///
    /// Returns the time left before a retry could be admitted.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.phase {
            Phase::Closed => Ok(()),
            Phase::Open { until } if now < until => Err(until - now),
            Phase::Open { .. } => Ok(()),
            Phase::Probing => Err(Duration::ZERO),
        }
    }

    /// Ask to contact the store.
    ///
    /// Past the cool-down the first caller claims the probe slot and resets
    /// the failure count; everyone else is refused until the probe resolves.
    pub fn admit(&mut self, now: Instant) -> Result<Admission, Duration> {
        match self.phase {
            Phase::Closed => Ok(Admission::Closed),
            Phase::Open { until } if now < until => Err(until - now),
            Phase::Open { .. } => {
                info!("Circuit breaker cool-down elapsed, admitting probe");
                self.phase = Phase::Probing;
                self.failure_count = 0;
                Ok(Admission::Probe)
            }
            Phase::Probing => Err(Duration::ZERO),
        }
    }

    /// A new physical connection was opened
    pub fn record_connect(&mut self) {
        self.failure_count = 0;
    }

    /// An acquisition succeeded
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        if self.phase != Phase::Closed {
            info!("Circuit breaker closed after successful acquisition");
        }
        self.phase = Phase::Closed;
    }

    /// An acquisition failed. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.phase {
            Phase::Closed if self.failure_count >= self.config.failure_threshold => {
                self.open(now);
                true
            }
            Phase::Closed => {
                debug!(
                    failures = self.failure_count,
                    threshold = self.config.failure_threshold,
                    "Acquisition failure recorded"
                );
                false
            }
            Phase::Open { .. } if self.config.policy == CoolDownPolicy::ExtendOnFailure => {
                self.phase = Phase::Open {
                    until: now + self.config.cool_down,
                };
                false
            }
            Phase::Open { .. } | Phase::Probing => false,
        }
    }

    /// The probe acquisition failed; reopen for a fresh cool-down
    pub fn record_probe_failure(&mut self, now: Instant) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        self.open(now);
        true
    }

    /// The probe was cancelled before it resolved; free the slot for the next caller
    pub fn abandon_probe(&mut self, now: Instant) {
        if self.phase == Phase::Probing {
            debug!("Probe abandoned, re-arming probe slot");
            self.phase = Phase::Open { until: now };
        }
    }

    fn open(&mut self, now: Instant) {
        self.phase = Phase::Open {
            until: now + self.config.cool_down,
        };
        self.trips += 1;
        warn!(
            failures = self.failure_count,
            cool_down_ms = self.config.cool_down.as_millis() as u64,
            "Circuit breaker opened due to consecutive acquisition failures"
        );
    }
}
