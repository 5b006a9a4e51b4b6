//! Notification bridge contract and phase-to-event mapping
//!
//! The real-time transport lives elsewhere; the tracker only needs something
//! implementing [`NotificationBridge`]. Delivery failures never affect the
//! tracked state.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::state_machine::ExecutionPhase;

/// Outbound real-time event channel (usually a WebSocket bridge)
#[async_trait]
pub trait NotificationBridge: Send + Sync {
    async fn notify_agent_started(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;

    async fn notify_agent_thinking(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;

    async fn notify_tool_executing(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;

    async fn notify_agent_completed(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;

    async fn notify_agent_failed(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;

    async fn notify_agent_timeout(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()>;
}

/// Shared handle to a bridge
pub type SharedNotifier = Arc<dyn NotificationBridge>;

/// The bridge method a phase maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    AgentCompleted,
    AgentFailed,
    AgentTimeout,
}

impl NotificationKind {
    /// Exactly one notification per mapped phase, none for the rest.
    pub fn for_phase(phase: ExecutionPhase) -> Option<Self> {
        match phase {
            ExecutionPhase::Starting => Some(NotificationKind::AgentStarted),
            ExecutionPhase::Thinking
            | ExecutionPhase::ResultProcessing
            | ExecutionPhase::Completing => Some(NotificationKind::AgentThinking),
            ExecutionPhase::ToolPreparation | ExecutionPhase::ToolExecution => {
                Some(NotificationKind::ToolExecuting)
            }
            ExecutionPhase::Completed => Some(NotificationKind::AgentCompleted),
            ExecutionPhase::Failed => Some(NotificationKind::AgentFailed),
            ExecutionPhase::Timeout => Some(NotificationKind::AgentTimeout),
            ExecutionPhase::Created
            | ExecutionPhase::WebsocketSetup
            | ExecutionPhase::ContextValidation
            | ExecutionPhase::LlmInteraction
            | ExecutionPhase::CircuitBreakerOpen => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationKind::AgentStarted => "agent_started",
            NotificationKind::AgentThinking => "agent_thinking",
            NotificationKind::ToolExecuting => "tool_executing",
            NotificationKind::AgentCompleted => "agent_completed",
            NotificationKind::AgentFailed => "agent_failed",
            NotificationKind::AgentTimeout => "agent_timeout",
        };
        f.write_str(name)
    }
}

/// Invoke the bridge method for `kind`, bounded by `timeout`.
///
/// A panicking bridge is reported as an error like any other failure.
pub async fn dispatch(
    notifier: &dyn NotificationBridge,
    kind: NotificationKind,
    execution_id: &str,
    agent_name: &str,
    payload: Value,
    timeout: Duration,
) -> Result<()> {
    let call = async {
        match kind {
            NotificationKind::AgentStarted => notifier.notify_agent_started(execution_id, agent_name, payload).await,
            NotificationKind::AgentThinking => notifier.notify_agent_thinking(execution_id, agent_name, payload).await,
            NotificationKind::ToolExecuting => notifier.notify_tool_executing(execution_id, agent_name, payload).await,
            NotificationKind::AgentCompleted => notifier.notify_agent_completed(execution_id, agent_name, payload).await,
            NotificationKind::AgentFailed => notifier.notify_agent_failed(execution_id, agent_name, payload).await,
            NotificationKind::AgentTimeout => notifier.notify_agent_timeout(execution_id, agent_name, payload).await,
        }
    };

    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow::anyhow!("{} notification panicked", kind)),
        Err(_) => Err(anyhow::anyhow!("{} notification timed out after {:?}", kind, timeout)),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_mapping() {
        use ExecutionPhase as P;
        use NotificationKind as N;

        assert_eq!(NotificationKind::for_phase(P::Starting), Some(N::AgentStarted));
        assert_eq!(NotificationKind::for_phase(P::Thinking), Some(N::AgentThinking));
        assert_eq!(NotificationKind::for_phase(P::ToolPreparation), Some(N::ToolExecuting));
        assert_eq!(NotificationKind::for_phase(P::ToolExecution), Some(N::ToolExecuting));
        assert_eq!(NotificationKind::for_phase(P::ResultProcessing), Some(N::AgentThinking));
        assert_eq!(NotificationKind::for_phase(P::Completing), Some(N::AgentThinking));
        assert_eq!(NotificationKind::for_phase(P::Completed), Some(N::AgentCompleted));
        assert_eq!(NotificationKind::for_phase(P::Failed), Some(N::AgentFailed));
        assert_eq!(NotificationKind::for_phase(P::Timeout), Some(N::AgentTimeout));
        assert_eq!(NotificationKind::for_phase(P::LlmInteraction), None);
        assert_eq!(NotificationKind::for_phase(P::CircuitBreakerOpen), None);
    }

    #[tokio::test]
    async fn test_dispatch_calls_matching_method() {
        let notifier = RecordingNotifier::default();
        dispatch(
            &notifier,
            NotificationKind::ToolExecuting,
            "exec-1",
            "triage",
            json!({}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(notifier.kinds().await, vec![NotificationKind::ToolExecuting]);
    }

    #[tokio::test]
    async fn test_dispatch_is_bounded() {
        let notifier = RecordingNotifier {
            hang: true,
            ..Default::default()
        };
        let err = dispatch(
            &notifier,
            NotificationKind::AgentStarted,
            "exec-1",
            "triage",
            json!({}),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dispatch_contains_panics() {
        let notifier = RecordingNotifier {
            panic: true,
            ..Default::default()
        };
        let err = dispatch(
            &notifier,
            NotificationKind::AgentFailed,
            "exec-1",
            "triage",
            json!({}),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("panicked"));
        assert_eq!(notifier.kinds().await, vec![NotificationKind::AgentFailed]);
    }
}
