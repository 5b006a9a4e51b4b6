//! Per-execution circuit breaker
//!
//! Counts consecutive failures of guarded operations. Once the threshold is
//! reached the breaker opens and fast-fails until `recovery_timeout` has
//! elapsed, then lets a single trial through (half-open). A successful trial
//! closes it, a failed one reopens it and restarts the timer.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TimeoutConfig;

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of a breaker for status queries and callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// What a caller is allowed to do after asking the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed, run normally
    Normal,
    /// Recovery window elapsed, this call is the half-open trial
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            last_failure: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.failure_threshold, config.recovery_timeout)
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask for permission to run. `Err` carries how long to back off.
    pub fn try_acquire(&mut self) -> Result<Permit, Duration> {
        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let elapsed = self.last_failure.map(|t| t.elapsed()).unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    debug!("Circuit breaker transitioning to half-open");
                    Ok(Permit::Trial)
                } else {
                    Err(self.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    // One trial at a time; others wait for its verdict
                    Err(Duration::ZERO)
                } else {
                    self.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            debug!(previous = %self.state, "Circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
        self.trial_in_flight = false;

        let should_open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            warn!(
                "Circuit breaker opened after {} failures",
                self.failure_count
            );
        }
        should_open
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            last_failure_at: self.last_failure_at,
        }
    }
}
