use tracing::{info, instrument, warn};

use crate::execution_record::ExecutionRecord;

/// Execution telemetry built on tracing spans
pub struct ExecutionTelemetry {
    /// Service name attached to every span
    service_name: String,
}

impl ExecutionTelemetry {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        agent_name = %record.agent_name,
        user_id = %record.user_id,
        thread_id = %record.thread_id,
        service = %self.service_name
    ))]
    pub fn start_execution_span(&self, record: &ExecutionRecord) {
        info!(timeout_ms = record.timeout.as_millis() as u64, "Started execution trace span");
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        agent_name = %record.agent_name,
        final_state = %record.state,
        duration_ms = record.duration().as_millis() as u64,
        service = %self.service_name
    ))]
    pub fn end_execution_span(&self, record: &ExecutionRecord) {
        match &record.error {
            None => info!(heartbeats = record.heartbeat_count, "Execution finished"),
            Some(error) => warn!(error = %error, heartbeats = record.heartbeat_count, "Execution finished with error"),
        }
    }

    #[instrument(skip(self, record), fields(
        execution_id = %record.execution_id,
        agent_name = %record.agent_name,
        service = %self.service_name
    ))]
    pub fn record_event(&self, record: &ExecutionRecord, event_name: &str, details: &str) {
        info!(
            event = event_name,
            details = details,
            phase = %record.current_phase,
            "Recorded execution event"
        );
    }
}
