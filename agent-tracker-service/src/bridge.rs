//! Notification bridge that writes progress events to the log.
//!
//! Stands in for a WebSocket transport when the service runs on its own.

use agent_tracker::NotificationBridge;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

pub struct LogBridge;

impl LogBridge {
    fn emit(&self, event: &str, execution_id: &str, agent_name: &str, payload: &Value) -> Result<()> {
        info!(
            target: "agent_notifications",
            event,
            execution_id,
            agent_name,
            phase = payload.get("phase").and_then(serde_json::Value::as_str).unwrap_or_default(),
            payload = %payload,
            "Agent notification"
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationBridge for LogBridge {
    async fn notify_agent_started(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("agent_started", execution_id, agent_name, &payload)
    }

    async fn notify_agent_thinking(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("agent_thinking", execution_id, agent_name, &payload)
    }

    async fn notify_tool_executing(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("tool_executing", execution_id, agent_name, &payload)
    }

    async fn notify_agent_completed(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("agent_completed", execution_id, agent_name, &payload)
    }

    async fn notify_agent_failed(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("agent_failed", execution_id, agent_name, &payload)
    }

    async fn notify_agent_timeout(&self, execution_id: &str, agent_name: &str, payload: Value) -> Result<()> {
        self.emit("agent_timeout", execution_id, agent_name, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use agent_tracker::{ExecutionMetadata, ExecutionPhase, ExecutionRequest, ExecutionTracker, TrackerConfig};

    #[tokio::test]
    async fn test_log_bridge_acknowledges_notifications() {
        let config = TrackerConfig {
            heartbeat_timeout: Duration::from_millis(50),
            ..TrackerConfig::default()
        };
        let tracker = ExecutionTracker::builder(config)
            .notifier(Arc::new(LogBridge))
            .build()
            .unwrap();

        let id = tracker
            .create_execution(ExecutionRequest::new("triage", "user-1", "thread-1"))
            .await
            .unwrap();
        tracker.start_execution(&id).await;
        tracker.heartbeat(&id).await;
        assert!(
            tracker
                .transition_state(&id, ExecutionPhase::Thinking, ExecutionMetadata::new(), None)
                .await
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.check_heartbeats().await, vec![id.clone()]);

        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.phase_history.len(), 2);
        assert!(record.phase_history.iter().all(|t| t.notification_sent));
    }
}
