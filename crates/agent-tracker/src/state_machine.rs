//! Transition rules for execution state and phase
//!
//! Both axes are forward-only. The coarse [`ExecutionState`] follows
//! `Pending -> Starting -> Running -> Completing -> Completed`, and any live
//! state may be interrupted by `Failed`, `Timeout`, `Dead` or `Cancelled`.
//! The fine-grained [`ExecutionPhase`] follows an explicit successor table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Coarse execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Created, not yet started
    Pending,
    /// Start requested, waiting for the first heartbeat
    Starting,
    /// Heartbeating
    Running,
    /// Producing its final result
    Completing,
    Completed,
    Failed,
    Timeout,
    /// Heartbeat silence exceeded the liveness threshold
    Dead,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Starting => "STARTING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completing => "COMPLETING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Timeout => "TIMEOUT",
            ExecutionState::Dead => "DEAD",
            ExecutionState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Timeout
                | ExecutionState::Dead
                | ExecutionState::Cancelled
        )
    }

    /// States the death monitor watches
    pub fn is_started(&self) -> bool {
        matches!(
            self,
            ExecutionState::Starting | ExecutionState::Running | ExecutionState::Completing
        )
    }

    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        use ExecutionState::*;

        if self.is_terminal() {
            return false;
        }
        match to {
            Failed | Timeout | Dead | Cancelled => true,
            _ => matches!(
                (self, to),
                (Pending, Starting) | (Starting, Running) | (Running, Completing) | (Completing, Completed)
            ),
        }
    }

    /// Validate a transition, returning the target state on success
    pub fn transition(self, to: ExecutionState) -> Result<ExecutionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TrackerError::invalid_transition(self, to))
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained progress marker, independent from [`ExecutionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    Created,
    WebsocketSetup,
    ContextValidation,
    Starting,
    Thinking,
    ToolPreparation,
    LlmInteraction,
    ToolExecution,
    ResultProcessing,
    Completing,
    Completed,
    Timeout,
    Failed,
    CircuitBreakerOpen,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Created => "CREATED",
            ExecutionPhase::WebsocketSetup => "WEBSOCKET_SETUP",
            ExecutionPhase::ContextValidation => "CONTEXT_VALIDATION",
            ExecutionPhase::Starting => "STARTING",
            ExecutionPhase::Thinking => "THINKING",
            ExecutionPhase::ToolPreparation => "TOOL_PREPARATION",
            ExecutionPhase::LlmInteraction => "LLM_INTERACTION",
            ExecutionPhase::ToolExecution => "TOOL_EXECUTION",
            ExecutionPhase::ResultProcessing => "RESULT_PROCESSING",
            ExecutionPhase::Completing => "COMPLETING",
            ExecutionPhase::Completed => "COMPLETED",
            ExecutionPhase::Timeout => "TIMEOUT",
            ExecutionPhase::Failed => "FAILED",
            ExecutionPhase::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed | ExecutionPhase::Failed | ExecutionPhase::Timeout
        )
    }

    /// Forward successors on the normal progress path.
    ///
    /// The setup phases are optional, and an agent may go straight from
    /// thinking to a tool call or from a tool call to completion. Anything
    /// not listed here is a skip and gets rejected.
    fn successors(&self) -> &'static [ExecutionPhase] {
        use ExecutionPhase::*;

        match self {
            Created => &[WebsocketSetup, ContextValidation, Starting, Thinking],
            WebsocketSetup => &[ContextValidation, Starting],
            ContextValidation => &[Starting],
            Starting => &[Thinking],
            Thinking => &[ToolPreparation, LlmInteraction, ToolExecution, Completing],
            ToolPreparation => &[LlmInteraction, ToolExecution],
            LlmInteraction => &[ToolExecution, ResultProcessing],
            ToolExecution => &[ResultProcessing, Completing],
            ResultProcessing => &[Completing],
            Completing => &[Completed],
            Completed | Timeout | Failed | CircuitBreakerOpen => &[],
        }
    }

    pub fn can_transition_to(&self, to: ExecutionPhase) -> bool {
        use ExecutionPhase::*;

        if self.is_terminal() {
            return false;
        }
        match to {
            Failed | Timeout => true,
            CircuitBreakerOpen => *self != CircuitBreakerOpen,
            _ => self.successors().contains(&to),
        }
    }

    pub fn transition(self, to: ExecutionPhase) -> Result<ExecutionPhase> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TrackerError::invalid_transition(self, to))
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-function form of the state table, for callers holding raw states.
pub fn is_valid_transition(from: ExecutionState, to: ExecutionState) -> bool {
    from.can_transition_to(to)
}
