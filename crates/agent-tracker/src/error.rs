//! Error types for the execution tracking engine

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the tracker.
///
/// Expected conditions (unknown execution, terminal guard) are reported as
/// `false`/`None` by the facade; these variants only cross the boundary where
/// a caller needs to tell failure modes apart, e.g. a breaker fast-fail versus
/// a real operation failure.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Circuit breaker open for execution {execution_id}, retry in {retry_after:?}")]
    CircuitOpen {
        execution_id: String,
        retry_after: Duration,
    },

    #[error("Operation for execution {execution_id} exceeded {timeout:?}")]
    OperationTimeout {
        execution_id: String,
        timeout: Duration,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        TrackerError::Configuration(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        TrackerError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// True when the call was rejected by an open breaker without running.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, TrackerError::CircuitOpen { .. })
    }

    /// Suggested wait before retrying, only set for breaker fast-fails.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TrackerError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
