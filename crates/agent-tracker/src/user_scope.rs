//! Per-user view over the tracker
//!
//! Every read filters on the owning user and every mutation first checks
//! ownership, so one user's session can never observe or finalize another
//! user's executions.

use crate::error::Result;
use crate::execution_record::{ExecutionMetadata, ExecutionRecord, ExecutionRequest};
use crate::execution_tracker::ExecutionTracker;
use crate::notifier::NotificationBridge;
use crate::state_machine::{ExecutionPhase, ExecutionState};

#[derive(Clone)]
pub struct UserScope {
    tracker: ExecutionTracker,
    user_id: String,
}

impl UserScope {
    pub(crate) fn new(tracker: ExecutionTracker, user_id: &str) -> Self {
        Self {
            tracker,
            user_id: user_id.to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn owns(&self, execution_id: &str) -> bool {
        self.get_execution(execution_id).await.is_some()
    }

    /// Create an execution owned by this user
    pub async fn create_execution(&self, agent_name: &str, thread_id: &str) -> Result<String> {
        self.tracker
            .create_execution(ExecutionRequest::new(agent_name, &self.user_id, thread_id))
            .await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.tracker
            .get_execution(execution_id)
            .await
            .filter(|r| r.user_id == self.user_id)
    }

    pub async fn get_executions(&self) -> Vec<ExecutionRecord> {
        self.tracker.get_user_executions(&self.user_id).await
    }

    pub async fn get_active_executions(&self) -> Vec<ExecutionRecord> {
        let mut records = self.get_executions().await;
        records.retain(|r| r.is_alive());
        records
    }

    pub async fn get_executions_by_thread(&self, thread_id: &str) -> Vec<ExecutionRecord> {
        let mut records = self.tracker.get_executions_by_thread(thread_id).await;
        records.retain(|r| r.user_id == self.user_id);
        records
    }

    pub async fn heartbeat(&self, execution_id: &str) -> bool {
        self.owns(execution_id).await && self.tracker.heartbeat(execution_id).await
    }

    pub async fn update_execution_state(
        &self,
        execution_id: &str,
        new_state: ExecutionState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        self.owns(execution_id).await
            && self
                .tracker
                .update_execution_state(execution_id, new_state, result, error)
                .await
    }

    pub async fn transition_state(
        &self,
        execution_id: &str,
        new_phase: ExecutionPhase,
        metadata: ExecutionMetadata,
        notifier: Option<&dyn NotificationBridge>,
    ) -> bool {
        self.owns(execution_id).await
            && self
                .tracker
                .transition_state(execution_id, new_phase, metadata, notifier)
                .await
    }

    pub async fn cancel_execution(&self, execution_id: &str, reason: &str) -> bool {
        self.owns(execution_id).await && self.tracker.cancel_execution(execution_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;

    #[tokio::test]
    async fn test_scope_hides_other_users() {
        let tracker = ExecutionTracker::new(TrackerConfig::default()).unwrap();
        let alice = tracker.for_user("alice");
        let bob = tracker.for_user("bob");

        let a = alice.create_execution("triage", "thread-a").await.unwrap();
        let b = bob.create_execution("triage", "thread-b").await.unwrap();

        assert!(alice.get_execution(&b).await.is_none());
        assert!(!alice.cancel_execution(&b, "not mine").await);
        assert!(!alice.heartbeat(&b).await);
        assert_eq!(
            tracker.get_execution(&b).await.unwrap().state,
            ExecutionState::Pending
        );

        assert!(alice.cancel_execution(&a, "done").await);
        let ids: Vec<_> = bob.get_executions().await.into_iter().map(|r| r.execution_id).collect();
        assert_eq!(ids, vec![b]);
        assert!(alice.get_active_executions().await.is_empty());
    }
}
