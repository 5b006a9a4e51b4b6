use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TimeoutConfig;
use crate::error::{Result, TrackerError};
use crate::state_machine::{ExecutionPhase, ExecutionState};

/// Maximum number of caller-supplied metadata entries kept per map
pub const MAX_METADATA_ENTRIES: usize = 64;

/// Bounded key/value context supplied by callers.
///
/// Never interpreted by the tracker, only stored and returned for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionMetadata(BTreeMap<String, serde_json::Value>);

impl ExecutionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. New keys are refused once the map is full.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> bool {
        let key = key.into();
        if self.0.len() >= MAX_METADATA_ENTRIES && !self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl FromIterator<(String, serde_json::Value)> for ExecutionMetadata {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// One entry of the append-only phase history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from_phase: ExecutionPhase,
    pub to_phase: ExecutionPhase,
    pub timestamp: DateTime<Utc>,
    /// Time spent in `from_phase`
    pub duration_ms: u64,
    pub metadata: ExecutionMetadata,
    pub notification_sent: bool,
    pub notification_error: Option<String>,
}

/// Parameters for a new execution
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent_name: String,
    pub user_id: String,
    pub thread_id: String,
    pub timeout: Option<Duration>,
    pub timeout_config: Option<TimeoutConfig>,
    pub metadata: ExecutionMetadata,
}

impl ExecutionRequest {
    pub fn new(agent_name: &str, user_id: &str, thread_id: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            timeout: None,
            timeout_config: None,
            metadata: ExecutionMetadata::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_config(mut self, timeout_config: TimeoutConfig) -> Self {
        self.timeout_config = Some(timeout_config);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Full state of one tracked agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub agent_name: String,
    pub user_id: String,
    pub thread_id: String,

    pub state: ExecutionState,
    pub current_phase: ExecutionPhase,
    pub phase_history: Vec<PhaseTransition>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When `current_phase` was entered
    pub phase_entered_at: DateTime<Utc>,

    pub heartbeat_count: u64,

    /// Wall-clock deadline measured from `started_at`
    pub timeout: Duration,
    pub timeout_config: TimeoutConfig,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    pub metadata: ExecutionMetadata,
}

impl ExecutionRecord {
    pub(crate) fn new(
        execution_id: String,
        request: ExecutionRequest,
        timeout: Duration,
        timeout_config: TimeoutConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            agent_name: request.agent_name,
            user_id: request.user_id,
            thread_id: request.thread_id,
            state: ExecutionState::Pending,
            current_phase: ExecutionPhase::Created,
            phase_history: Vec::new(),
            created_at: now,
            started_at: None,
            last_heartbeat: now,
            completed_at: None,
            phase_entered_at: now,
            heartbeat_count: 0,
            timeout,
            timeout_config,
            result: None,
            error: None,
            metadata: request.metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_alive(&self) -> bool {
        !self.is_terminal()
    }

    pub fn time_since_heartbeat(&self) -> Duration {
        since(self.last_heartbeat)
    }

    /// Run time counted towards the deadline
    pub fn elapsed(&self) -> Duration {
        since(self.started_at.unwrap_or(self.created_at))
    }

    pub fn is_timed_out(&self) -> bool {
        self.elapsed() > self.timeout
    }

    /// Total duration once terminal, run time so far otherwise
    pub fn duration(&self) -> Duration {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or_default()
    }

    /// Apply a validated state change, maintaining timestamps.
    pub(crate) fn apply_state(&mut self, to: ExecutionState) -> Result<ExecutionState> {
        let from = self.state;
        self.state = from.transition(to)?;

        let now = Utc::now();
        if to == ExecutionState::Starting {
            self.started_at = Some(now);
            self.last_heartbeat = now;
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(from)
    }

    /// Record a heartbeat. Returns true when it promoted STARTING to RUNNING.
    pub(crate) fn record_heartbeat(&mut self) -> Result<bool> {
        if self.is_terminal() {
            return Err(TrackerError::invalid_transition(self.state, "HEARTBEAT"));
        }
        self.last_heartbeat = Utc::now();
        self.heartbeat_count += 1;

        if self.state == ExecutionState::Starting {
            self.apply_state(ExecutionState::Running)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Validate and append a phase transition, returning its history index.
    pub(crate) fn transition_phase(
        &mut self,
        to: ExecutionPhase,
        metadata: ExecutionMetadata,
    ) -> Result<usize> {
        if self.is_terminal() {
            return Err(TrackerError::invalid_transition(self.state, to));
        }
        self.current_phase.transition(to)?;
        Ok(self.push_phase(to, metadata))
    }

    /// Append a phase transition without checking the tables.
    ///
    /// Only used by the monitors while finalizing a record under its lock.
    pub(crate) fn push_phase(&mut self, to: ExecutionPhase, metadata: ExecutionMetadata) -> usize {
        let now = Utc::now();
        let duration_ms = (now - self.phase_entered_at).num_milliseconds().max(0) as u64;

        self.phase_history.push(PhaseTransition {
            from_phase: self.current_phase,
            to_phase: to,
            timestamp: now,
            duration_ms,
            metadata,
            notification_sent: false,
            notification_error: None,
        });
        self.current_phase = to;
        self.phase_entered_at = now;
        self.phase_history.len() - 1
    }
}

fn since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            "exec_execution_1_0123abcd".to_string(),
            ExecutionRequest::new("triage", "user-1", "thread-1").with_metadata("source", json!("test")),
            Duration::from_secs(30),
            TimeoutConfig::default(),
        )
    }

    #[test]
    fn test_new_record() {
        let record = record();
        assert_eq!(record.state, ExecutionState::Pending);
        assert_eq!(record.current_phase, ExecutionPhase::Created);
        assert!(record.is_alive());
        assert!(record.started_at.is_none());
        assert_eq!(record.metadata.get("source"), Some(&json!("test")));
    }

    #[test]
    fn test_first_heartbeat_promotes_to_running() {
        let mut record = record();
        record.apply_state(ExecutionState::Starting).unwrap();
        assert!(record.started_at.is_some());

        assert!(record.record_heartbeat().unwrap());
        assert_eq!(record.state, ExecutionState::Running);
        assert!(!record.record_heartbeat().unwrap());
        assert_eq!(record.heartbeat_count, 2);
    }

    #[test]
    fn test_terminal_record_rejects_mutation() {
        let mut record = record();
        record.apply_state(ExecutionState::Cancelled).unwrap();
        assert!(record.completed_at.is_some());

        assert!(record.record_heartbeat().is_err());
        assert!(record.apply_state(ExecutionState::Failed).is_err());
        assert!(record
            .transition_phase(ExecutionPhase::Thinking, ExecutionMetadata::new())
            .is_err());
        assert_eq!(record.heartbeat_count, 0);
        assert!(record.phase_history.is_empty());
    }

    #[test]
    fn test_phase_history_append() {
        let mut record = record();
        let idx = record
            .transition_phase(ExecutionPhase::Thinking, ExecutionMetadata::new())
            .unwrap();
        assert_eq!(idx, 0);
        assert!(record
            .transition_phase(ExecutionPhase::Completed, ExecutionMetadata::new())
            .is_err());

        let entry = &record.phase_history[0];
        assert_eq!(entry.from_phase, ExecutionPhase::Created);
        assert_eq!(entry.to_phase, ExecutionPhase::Thinking);
        assert!(!entry.notification_sent);
        assert_eq!(record.current_phase, ExecutionPhase::Thinking);
    }

    #[test]
    fn test_metadata_is_bounded() {
        let mut metadata = ExecutionMetadata::new();
        for i in 0..MAX_METADATA_ENTRIES {
            assert!(metadata.insert(format!("k{}", i), json!(i)));
        }
        assert!(!metadata.insert("overflow", json!(true)));
        // Existing keys can still be updated
        assert!(metadata.insert("k0", json!("updated")));
        assert_eq!(metadata.len(), MAX_METADATA_ENTRIES);
        assert_eq!(metadata.to_json()["k0"], "updated");
    }
}
