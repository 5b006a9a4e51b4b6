use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::callbacks::{self, CallbackRegistry};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, Permit};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::execution_record::{ExecutionMetadata, ExecutionRecord, ExecutionRequest, PhaseTransition};
use crate::id_manager::{IdManager, IdStats, IdType};
use crate::metrics::{ExecutionMetrics, MetricsSnapshot};
use crate::monitor::MonitorHandle;
use crate::notifier::{self, NotificationBridge, NotificationKind, SharedNotifier};
use crate::state_machine::{ExecutionPhase, ExecutionState};
use crate::telemetry::ExecutionTelemetry;
use crate::user_scope::UserScope;

/// Event emitted when an execution changes
#[derive(Clone, Debug)]
pub enum ExecutionEvent {
    Created(ExecutionRecord),
    StateChanged {
        execution_id: String,
        from: ExecutionState,
        to: ExecutionState,
    },
    PhaseChanged {
        execution_id: String,
        transition: PhaseTransition,
    },
    Dead(ExecutionRecord),
    TimedOut(ExecutionRecord),
    CircuitOpened {
        execution_id: String,
        status: CircuitBreakerStatus,
    },
}

type RecordHandle = Arc<Mutex<ExecutionRecord>>;

struct BreakerEntry {
    breaker: Mutex<CircuitBreaker>,
    call_timeout: Duration,
}

pub(crate) struct TrackerInner {
    pub(crate) config: TrackerConfig,
    ids: Arc<IdManager>,
    /// Map lock is only held to look up or insert handles; each record has its own lock
    executions: RwLock<HashMap<String, RecordHandle>>,
    breakers: RwLock<HashMap<String, Arc<BreakerEntry>>>,
    callbacks: RwLock<CallbackRegistry>,
    notifier: Option<SharedNotifier>,
    metrics: Arc<ExecutionMetrics>,
    telemetry: Arc<ExecutionTelemetry>,
    event_sender: broadcast::Sender<ExecutionEvent>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Builder for [`ExecutionTracker`]
pub struct TrackerBuilder {
    config: TrackerConfig,
    ids: Option<Arc<IdManager>>,
    notifier: Option<SharedNotifier>,
    service_name: String,
    event_capacity: usize,
}

impl TrackerBuilder {
    /// Share an identifier manager with other components
    pub fn id_manager(mut self, ids: Arc<IdManager>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Default bridge used when a phase transition does not pass its own
    pub fn notifier(mut self, notifier: SharedNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<ExecutionTracker> {
        self.config.validate()?;
        let metrics = ExecutionMetrics::new()
            .map_err(|e| TrackerError::configuration(format!("metrics registry: {}", e)))?;
        let (event_sender, _) = broadcast::channel(self.event_capacity);

        Ok(ExecutionTracker {
            inner: Arc::new(TrackerInner {
                config: self.config,
                ids: self.ids.unwrap_or_default(),
                executions: RwLock::new(HashMap::new()),
                breakers: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(CallbackRegistry::default()),
                notifier: self.notifier,
                metrics: Arc::new(metrics),
                telemetry: Arc::new(ExecutionTelemetry::new(&self.service_name)),
                event_sender,
                monitor: Mutex::new(None),
            }),
        })
    }
}

/// Tracks agent executions: lifecycle, liveness, deadlines and breakers.
///
/// Cheap to clone; all clones share the same state. Construct one at process
/// start and hand clones to whoever needs it.
#[derive(Clone)]
pub struct ExecutionTracker {
    inner: Arc<TrackerInner>,
}

/// Why a monitor is finalizing an execution
#[derive(Clone, Copy)]
enum Verdict {
    Dead,
    Timeout,
}

impl ExecutionTracker {
    /// Create a tracker, rejecting malformed configuration
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            ids: None,
            notifier: None,
            service_name: "agent-tracker".to_string(),
            event_capacity: 1000,
        }
    }

    pub(crate) fn from_inner(inner: Arc<TrackerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn id_manager(&self) -> Arc<IdManager> {
        Arc::clone(&self.inner.ids)
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.event_sender.subscribe()
    }

    /// View of the tracker limited to one user's executions
    pub fn for_user(&self, user_id: &str) -> UserScope {
        UserScope::new(self.clone(), user_id)
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine
        let _ = self.inner.event_sender.send(event);
    }

    async fn handle(&self, execution_id: &str) -> Option<RecordHandle> {
        self.inner.executions.read().await.get(execution_id).cloned()
    }

    async fn handles(&self) -> Vec<RecordHandle> {
        self.inner.executions.read().await.values().cloned().collect()
    }

    async fn snapshots(&self, filter: impl Fn(&ExecutionRecord) -> bool) -> Vec<ExecutionRecord> {
        let mut records = Vec::new();
        for handle in self.handles().await {
            let record = handle.lock().await;
            if filter(&*record) {
                records.push(record.clone());
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Register a new execution in PENDING state and return its id.
    ///
    /// A malformed per-request timeout or timeout config is rejected with
    /// [`TrackerError::Configuration`] before anything is registered.
    #[instrument(skip(self, request), fields(agent_name = %request.agent_name, user_id = %request.user_id))]
    pub async fn create_execution(&self, request: ExecutionRequest) -> Result<String> {
        let config = &self.inner.config;
        if let Some(timeout_config) = &request.timeout_config {
            timeout_config.validate()?;
        }
        if request.timeout.is_some_and(|t| t.is_zero()) {
            return Err(TrackerError::configuration("execution timeout must be positive"));
        }

        let execution_id = self.inner.ids.generate_id(IdType::Execution, "exec");

        let timeout = request
            .timeout
            .or_else(|| request.timeout_config.as_ref().map(|c| c.agent_execution_timeout))
            .unwrap_or(config.execution_timeout);
        let timeout_config = request
            .timeout_config
            .clone()
            .unwrap_or_else(|| config.default_timeout_config.clone());

        let mut context = HashMap::new();
        context.insert("agent_name".to_string(), json!(request.agent_name));
        context.insert("user_id".to_string(), json!(request.user_id));
        context.insert("thread_id".to_string(), json!(request.thread_id));
        self.inner.ids.register_metadata(&execution_id, context);

        let record = ExecutionRecord::new(execution_id.clone(), request, timeout, timeout_config);

        // Visible to queries before anyone hears about it
        self.inner
            .executions
            .write()
            .await
            .insert(execution_id.clone(), Arc::new(Mutex::new(record.clone())));

        self.inner.metrics.execution_created();
        self.inner.telemetry.start_execution_span(&record);
        info!(
            execution_id = %execution_id,
            agent_name = %record.agent_name,
            timeout_ms = timeout.as_millis() as u64,
            "Tracking new execution"
        );
        self.emit(ExecutionEvent::Created(record));

        Ok(execution_id)
    }

    /// PENDING -> STARTING. The first heartbeat then moves it to RUNNING.
    pub async fn start_execution(&self, execution_id: &str) -> bool {
        self.apply_states(execution_id, |_| vec![ExecutionState::Starting], None, None)
            .await
    }

    /// Record a liveness signal
    pub async fn heartbeat(&self, execution_id: &str) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            debug!(execution_id = %execution_id, "Heartbeat for unknown execution");
            return false;
        };

        let promoted = {
            let mut record = handle.lock().await;
            match record.record_heartbeat() {
                Ok(promoted) => promoted,
                Err(_) => {
                    debug!(execution_id = %execution_id, state = %record.state, "Heartbeat rejected for finished execution");
                    return false;
                }
            }
        };

        self.inner.metrics.heartbeat();
        if promoted {
            info!(execution_id = %execution_id, "Execution running after first heartbeat");
            self.emit(ExecutionEvent::StateChanged {
                execution_id: execution_id.to_string(),
                from: ExecutionState::Starting,
                to: ExecutionState::Running,
            });
        }
        true
    }

    /// Move an execution to `new_state`.
    ///
    /// `result` is stored when the new state is COMPLETED, `error` for any other
    /// terminal state; both are ignored otherwise. Invalid transitions, unknown
    /// ids and finished executions return false.
    #[instrument(skip(self, result, error))]
    pub async fn update_execution_state(
        &self,
        execution_id: &str,
        new_state: ExecutionState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        self.apply_states(execution_id, |_| vec![new_state], result, error)
            .await
    }

    /// Finish successfully, passing through COMPLETING when still RUNNING
    pub async fn complete_execution(&self, execution_id: &str, result: serde_json::Value) -> bool {
        self.apply_states(
            execution_id,
            |current| match current {
                ExecutionState::Running => vec![ExecutionState::Completing, ExecutionState::Completed],
                _ => vec![ExecutionState::Completed],
            },
            Some(result),
            None,
        )
        .await
    }

    pub async fn fail_execution(&self, execution_id: &str, error: &str) -> bool {
        self.apply_states(
            execution_id,
            |_| vec![ExecutionState::Failed],
            None,
            Some(error.to_string()),
        )
        .await
    }

    pub async fn cancel_execution(&self, execution_id: &str, reason: &str) -> bool {
        self.apply_states(
            execution_id,
            |_| vec![ExecutionState::Cancelled],
            None,
            Some(format!("Cancelled: {}", reason)),
        )
        .await
    }

    /// Apply a chain of state changes atomically under the record lock.
    ///
    /// `plan` picks the chain from the state observed under that same lock.
    async fn apply_states(
        &self,
        execution_id: &str,
        plan: impl FnOnce(ExecutionState) -> Vec<ExecutionState>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            warn!(execution_id = %execution_id, "Execution not found for state update");
            return false;
        };

        let (changes, snapshot) = {
            let mut record = handle.lock().await;
            let steps = plan(record.state);

            // Validate the whole chain before touching the record
            let mut current = record.state;
            for step in &steps {
                if let Err(e) = current.transition(*step) {
                    warn!(execution_id = %execution_id, error = %e, "Rejected state transition");
                    return false;
                }
                current = *step;
            }

            let mut changes = Vec::with_capacity(steps.len());
            for step in steps {
                match record.apply_state(step) {
                    Ok(from) => changes.push((from, step)),
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "Rejected state transition");
                        return false;
                    }
                }
            }

            match record.state {
                ExecutionState::Completed => record.result = result,
                state if state.is_terminal() => {
                    record.error = Some(error.unwrap_or_else(|| format!("Execution ended in state {}", state)));
                }
                _ => {}
            }
            (changes, record.clone())
        };

        for (from, to) in changes {
            info!(execution_id = %execution_id, from = %from, to = %to, "Execution state updated");
            self.emit(ExecutionEvent::StateChanged {
                execution_id: execution_id.to_string(),
                from,
                to,
            });
        }
        if snapshot.is_terminal() {
            self.finished(&snapshot);
        }
        true
    }

    /// Bookkeeping shared by every terminal transition
    fn finished(&self, record: &ExecutionRecord) {
        self.inner
            .metrics
            .execution_finished(record.state, record.duration().as_millis() as u64);
        self.inner.telemetry.end_execution_span(record);
    }

    // ========================================================================
    // PHASES
    // ========================================================================

    /// Advance the fine-grained phase and notify the bridge.
    ///
    /// `notifier` overrides the tracker's default bridge. A failed or slow
    /// notification is recorded on the history entry; it never reverts the
    /// transition.
    #[instrument(skip(self, metadata, notifier))]
    pub async fn transition_state(
        &self,
        execution_id: &str,
        new_phase: ExecutionPhase,
        metadata: ExecutionMetadata,
        notifier: Option<&dyn NotificationBridge>,
    ) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            warn!(execution_id = %execution_id, "Execution not found for phase transition");
            return false;
        };

        let (index, transition, record_snapshot) = {
            let mut record = handle.lock().await;
            match record.transition_phase(new_phase, metadata) {
                Ok(index) => (index, record.phase_history[index].clone(), record.clone()),
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Rejected phase transition");
                    return false;
                }
            }
        };

        self.inner.metrics.phase_transition();
        debug!(
            execution_id = %execution_id,
            from = %transition.from_phase,
            to = %transition.to_phase,
            duration_ms = transition.duration_ms,
            "Phase transition"
        );
        self.emit(ExecutionEvent::PhaseChanged {
            execution_id: execution_id.to_string(),
            transition: transition.clone(),
        });

        let bridge = notifier.or(self.inner.notifier.as_deref());
        self.notify_transition(&handle, &record_snapshot, index, &transition, bridge)
            .await;
        true
    }

    async fn notify_transition(
        &self,
        handle: &RecordHandle,
        record: &ExecutionRecord,
        index: usize,
        transition: &PhaseTransition,
        bridge: Option<&dyn NotificationBridge>,
    ) {
        let (Some(bridge), Some(kind)) = (bridge, NotificationKind::for_phase(transition.to_phase)) else {
            return;
        };

        let payload = json!({
            "phase": transition.to_phase,
            "from_phase": transition.from_phase,
            "duration_ms": transition.duration_ms,
            "timestamp": transition.timestamp.to_rfc3339(),
            "user_id": record.user_id,
            "thread_id": record.thread_id,
            "state": record.state,
            "error": record.error,
            "metadata": transition.metadata.to_json(),
        });

        let outcome = notifier::dispatch(
            bridge,
            kind,
            &record.execution_id,
            &record.agent_name,
            payload,
            self.inner.config.notification_timeout,
        )
        .await;

        let error = match outcome {
            Ok(()) => None,
            Err(e) => {
                self.inner.metrics.notification_failed();
                warn!(execution_id = %record.execution_id, notification = %kind, error = %e, "Notification failed");
                self.inner
                    .telemetry
                    .record_event(record, "notification_failed", &e.to_string());
                Some(e.to_string())
            }
        };

        let mut record = handle.lock().await;
        if let Some(entry) = record.phase_history.get_mut(index) {
            entry.notification_sent = error.is_none();
            entry.notification_error = error;
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Get execution record
    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        let handle = self.handle(execution_id).await?;
        let record = handle.lock().await;
        Some(record.clone())
    }

    /// Live executions, oldest first
    pub async fn get_active_executions(&self) -> Vec<ExecutionRecord> {
        self.snapshots(|r| r.is_alive()).await
    }

    pub async fn get_executions_by_agent(&self, agent_name: &str) -> Vec<ExecutionRecord> {
        self.snapshots(|r| r.agent_name == agent_name).await
    }

    pub async fn get_executions_by_thread(&self, thread_id: &str) -> Vec<ExecutionRecord> {
        self.snapshots(|r| r.thread_id == thread_id).await
    }

    pub async fn get_user_executions(&self, user_id: &str) -> Vec<ExecutionRecord> {
        self.snapshots(|r| r.user_id == user_id).await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn get_id_stats(&self) -> IdStats {
        self.inner.ids.get_stats()
    }

    // ========================================================================
    // CALLBACKS
    // ========================================================================

    pub async fn register_death_callback<F, Fut>(&self, handler: F)
    where
        F: Fn(ExecutionRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .write()
            .await
            .death
            .push(callbacks::execution_callback(handler));
    }

    pub async fn register_timeout_callback<F, Fut>(&self, handler: F)
    where
        F: Fn(ExecutionRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .write()
            .await
            .timeout
            .push(callbacks::execution_callback(handler));
    }

    pub async fn register_circuit_breaker_callback<F, Fut>(&self, handler: F)
    where
        F: Fn(String, CircuitBreakerStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .write()
            .await
            .circuit_breaker
            .push(callbacks::circuit_breaker_callback(handler));
    }

    // ========================================================================
    // CIRCUIT BREAKER
    // ========================================================================

    /// Create the breaker for an execution from its timeout config.
    /// Idempotent; false when the execution is unknown.
    pub async fn register_circuit_breaker(&self, execution_id: &str) -> bool {
        self.breaker(execution_id).await.is_some()
    }

    async fn breaker(&self, execution_id: &str) -> Option<Arc<BreakerEntry>> {
        if let Some(entry) = self.inner.breakers.read().await.get(execution_id) {
            return Some(Arc::clone(entry));
        }

        let config = {
            let handle = self.handle(execution_id).await?;
            let record = handle.lock().await;
            record.timeout_config.clone()
        };

        let mut breakers = self.inner.breakers.write().await;
        let entry = breakers.entry(execution_id.to_string()).or_insert_with(|| {
            debug!(execution_id = %execution_id, threshold = config.failure_threshold, "Registered circuit breaker");
            Arc::new(BreakerEntry {
                breaker: Mutex::new(CircuitBreaker::from_config(&config)),
                call_timeout: config.llm_api_timeout,
            })
        });
        Some(Arc::clone(entry))
    }

    pub async fn circuit_breaker_status(&self, execution_id: &str) -> Option<CircuitBreakerStatus> {
        let entry = self.inner.breakers.read().await.get(execution_id).cloned()?;
        let status = entry.breaker.lock().await.status();
        Some(status)
    }

    /// Run `operation` behind the execution's circuit breaker.
    ///
    /// Fails fast with [`TrackerError::CircuitOpen`] without invoking the
    /// operation while the breaker is open. Each call is bounded by the
    /// execution's `llm_api_timeout`; timeouts and panics count as failures.
    pub async fn execute_with_breaker<F, Fut, T>(&self, execution_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let entry = self
            .breaker(execution_id)
            .await
            .ok_or_else(|| TrackerError::ExecutionNotFound(execution_id.to_string()))?;

        let permit = entry.breaker.lock().await.try_acquire();
        match permit {
            Ok(Permit::Trial) => debug!(execution_id = %execution_id, "Running half-open trial"),
            Ok(Permit::Normal) => {}
            Err(retry_after) => {
                debug!(execution_id = %execution_id, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, failing fast");
                return Err(TrackerError::CircuitOpen {
                    execution_id: execution_id.to_string(),
                    retry_after,
                });
            }
        }

        let outcome = tokio::time::timeout(entry.call_timeout, AssertUnwindSafe(operation()).catch_unwind()).await;
        let error = match outcome {
            Ok(Ok(Ok(value))) => {
                entry.breaker.lock().await.record_success();
                return Ok(value);
            }
            Ok(Ok(Err(e))) => TrackerError::Operation(e),
            Ok(Err(_)) => TrackerError::Operation(anyhow::anyhow!("operation panicked")),
            Err(_) => TrackerError::OperationTimeout {
                execution_id: execution_id.to_string(),
                timeout: entry.call_timeout,
            },
        };

        let (opened, status) = {
            let mut breaker = entry.breaker.lock().await;
            let opened = breaker.record_failure();
            (opened, breaker.status())
        };
        debug!(execution_id = %execution_id, failures = status.failure_count, error = %error, "Guarded operation failed");

        if opened {
            self.breaker_opened(execution_id, status).await;
        }
        Err(error)
    }

    async fn breaker_opened(&self, execution_id: &str, status: CircuitBreakerStatus) {
        self.inner.metrics.circuit_breaker_opened();
        warn!(
            execution_id = %execution_id,
            failures = status.failure_count,
            recovery_ms = status.recovery_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        if let Some(record) = self.get_execution(execution_id).await {
            self.inner
                .telemetry
                .record_event(&record, "circuit_breaker_opened", &format!("{} failures", status.failure_count));
        }
        self.emit(ExecutionEvent::CircuitOpened {
            execution_id: execution_id.to_string(),
            status: status.clone(),
        });

        let handlers = self.inner.callbacks.read().await.circuit_breaker.clone();
        for handler in handlers {
            callbacks::run_guarded(
                "circuit_breaker",
                execution_id,
                handler(execution_id.to_string(), status.clone()),
                self.inner.config.notification_timeout,
            )
            .await;
        }
    }

    // ========================================================================
    // MONITORING
    // ========================================================================

    /// Run one death-detection sweep. Returns the ids declared dead.
    pub async fn check_heartbeats(&self) -> Vec<String> {
        let limit = self.inner.config.heartbeat_timeout;
        let mut dead = Vec::new();

        for handle in self.handles().await {
            let finalized = {
                let mut record = handle.lock().await;
                if !record.state.is_started() || record.time_since_heartbeat() <= limit {
                    continue;
                }
                let error = format!(
                    "No heartbeat received for {:.1}s (heartbeat timeout {:.1}s)",
                    record.time_since_heartbeat().as_secs_f64(),
                    limit.as_secs_f64()
                );
                Self::force_terminal(&mut record, Verdict::Dead, error)
            };

            if let Some((record, from, index)) = finalized {
                dead.push(record.execution_id.clone());
                self.settle(&handle, Verdict::Dead, record, from, index).await;
            }
        }
        dead
    }

    /// Run one deadline sweep. Returns the ids that timed out.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let mut timed_out = Vec::new();

        for handle in self.handles().await {
            let finalized = {
                let mut record = handle.lock().await;
                if record.is_terminal() || !record.is_timed_out() {
                    continue;
                }
                let error = format!(
                    "Execution timeout after {:.1}s (limit {:.1}s)",
                    record.elapsed().as_secs_f64(),
                    record.timeout.as_secs_f64()
                );
                Self::force_terminal(&mut record, Verdict::Timeout, error)
            };

            if let Some((record, from, index)) = finalized {
                timed_out.push(record.execution_id.clone());
                self.settle(&handle, Verdict::Timeout, record, from, index).await;
            }
        }
        timed_out
    }

    /// Check a single execution against its deadline, finalizing it if exceeded.
    pub async fn check_timeout(&self, execution_id: &str) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            return false;
        };

        let finalized = {
            let mut record = handle.lock().await;
            if record.is_terminal() || !record.is_timed_out() {
                return false;
            }
            let error = format!(
                "Execution timeout after {:.1}s (limit {:.1}s)",
                record.elapsed().as_secs_f64(),
                record.timeout.as_secs_f64()
            );
            Self::force_terminal(&mut record, Verdict::Timeout, error)
        };

        match finalized {
            Some((record, from, index)) => {
                self.settle(&handle, Verdict::Timeout, record, from, index).await;
                true
            }
            None => false,
        }
    }

    /// Finalize a record under its lock. Returns the snapshot, the previous
    /// state and the index of the forced phase entry, if one was appended.
    fn force_terminal(
        record: &mut ExecutionRecord,
        verdict: Verdict,
        error: String,
    ) -> Option<(ExecutionRecord, ExecutionState, Option<usize>)> {
        let (state, phase, reason) = match verdict {
            Verdict::Dead => (ExecutionState::Dead, ExecutionPhase::Failed, "heartbeat_timeout"),
            Verdict::Timeout => (ExecutionState::Timeout, ExecutionPhase::Timeout, "execution_timeout"),
        };

        let from = record.apply_state(state).ok()?;
        record.error = Some(error);

        let index = record.current_phase.can_transition_to(phase).then(|| {
            record.push_phase(phase, ExecutionMetadata::new().with("reason", json!(reason)))
        });
        Some((record.clone(), from, index))
    }

    /// Run the post-verdict work for one record so that a panic there cannot
    /// stop the sweep from reaching the remaining records.
    async fn settle(
        &self,
        handle: &RecordHandle,
        verdict: Verdict,
        record: ExecutionRecord,
        from: ExecutionState,
        index: Option<usize>,
    ) {
        let execution_id = record.execution_id.clone();
        let work = self.after_verdict(handle, verdict, record, from, index);
        if AssertUnwindSafe(work).catch_unwind().await.is_err() {
            error!(execution_id = %execution_id, "Finalizing execution panicked");
        }
    }

    async fn after_verdict(
        &self,
        handle: &RecordHandle,
        verdict: Verdict,
        record: ExecutionRecord,
        from: ExecutionState,
        index: Option<usize>,
    ) {
        let execution_id = record.execution_id.clone();
        let (event_name, event) = match verdict {
            Verdict::Dead => ("execution_dead", ExecutionEvent::Dead(record.clone())),
            Verdict::Timeout => ("execution_timeout", ExecutionEvent::TimedOut(record.clone())),
        };

        warn!(
            execution_id = %execution_id,
            agent_name = %record.agent_name,
            from = %from,
            to = %record.state,
            error = record.error.as_deref().unwrap_or_default(),
            "Execution finalized by monitor"
        );
        self.inner
            .telemetry
            .record_event(&record, event_name, record.error.as_deref().unwrap_or_default());
        self.emit(ExecutionEvent::StateChanged {
            execution_id: execution_id.clone(),
            from,
            to: record.state,
        });
        self.emit(event);
        self.finished(&record);

        if let Some(index) = index {
            self.inner.metrics.phase_transition();
            let transition = record.phase_history[index].clone();
            self.emit(ExecutionEvent::PhaseChanged {
                execution_id: execution_id.clone(),
                transition: transition.clone(),
            });
            self.notify_transition(handle, &record, index, &transition, self.inner.notifier.as_deref())
                .await;
        }

        let (kind, handlers) = {
            let registry = self.inner.callbacks.read().await;
            match verdict {
                Verdict::Dead => ("death", registry.death.clone()),
                Verdict::Timeout => ("timeout", registry.timeout.clone()),
            }
        };
        for handler in handlers {
            callbacks::run_guarded(kind, &execution_id, handler(record.clone()), self.inner.config.notification_timeout)
                .await;
        }
    }

    /// Drop a finished execution, its breaker, and release its id.
    /// Live executions are never released.
    pub async fn release_execution(&self, execution_id: &str) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            return false;
        };
        if handle.lock().await.is_alive() {
            debug!(execution_id = %execution_id, "Refusing to release live execution");
            return false;
        }

        self.inner.executions.write().await.remove(execution_id);
        self.inner.breakers.write().await.remove(execution_id);
        self.inner.ids.release_id(execution_id);
        debug!(execution_id = %execution_id, "Released execution");
        true
    }

    /// Release finished executions older than the retention window
    pub async fn cleanup_completed(&self) -> usize {
        let retention = self.inner.config.retention;
        let mut expired = Vec::new();
        for handle in self.handles().await {
            let record = handle.lock().await;
            let Some(completed_at) = record.completed_at else {
                continue;
            };
            let age = (chrono::Utc::now() - completed_at).to_std().unwrap_or_default();
            if record.is_terminal() && age >= retention {
                expired.push(record.execution_id.clone());
            }
        }

        let mut released = 0;
        for execution_id in expired {
            if self.release_execution(&execution_id).await {
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "Cleaned up finished executions");
        }
        released
    }

    /// Start the background sweeps. Calling it again while running is a no-op.
    pub async fn start_monitoring(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.is_some() {
            debug!("Monitoring already running");
            return;
        }
        *monitor = Some(MonitorHandle::spawn(&self.inner));
    }

    /// Stop the background sweeps and wait for them to exit
    pub async fn stop_monitoring(&self) {
        let handle = self.inner.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::notifier::testing::RecordingNotifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            heartbeat_timeout: Duration::from_millis(100),
            execution_timeout: Duration::from_secs(30),
            heartbeat_check_interval: Duration::from_millis(20),
            timeout_check_interval: Duration::from_millis(20),
            ..TrackerConfig::default()
        }
    }

    async fn running(tracker: &ExecutionTracker) -> String {
        let id = tracker
            .create_execution(ExecutionRequest::new("triage", "user-1", "thread-1"))
            .await
            .unwrap();
        assert!(tracker.start_execution(&id).await);
        assert!(tracker.heartbeat(&id).await);
        id
    }

    #[tokio::test]
    async fn test_lifecycle_to_completion() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let id = running(&tracker).await;

        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Running);
        assert_eq!(record.heartbeat_count, 1);

        assert!(tracker.complete_execution(&id, json!({"answer": 42})).await);
        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.result, Some(json!({"answer": 42})));
        assert!(record.error.is_none());
        assert!(record.completed_at.is_some());

        let metrics = tracker.get_metrics();
        assert_eq!(metrics.successful_executions, 1);
        assert_eq!(metrics.active_executions, 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_fail_softly() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        assert!(!tracker.heartbeat("missing").await);
        assert!(!tracker.start_execution("missing").await);
        assert!(
            !tracker
                .transition_state("missing", ExecutionPhase::Thinking, ExecutionMetadata::new(), None)
                .await
        );
        assert!(tracker.get_execution("missing").await.is_none());
        assert!(tracker.circuit_breaker_status("missing").await.is_none());
        assert!(!tracker.check_timeout("missing").await);
        assert!(matches!(
            tracker.execute_with_breaker("missing", || async { Ok::<_, anyhow::Error>(()) }).await,
            Err(TrackerError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_death_sweep_fires_callback_once() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tracker
            .register_death_callback(move |_record| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        let id = running(&tracker).await;
        assert!(tracker.check_heartbeats().await.is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.check_heartbeats().await, vec![id.clone()]);
        assert!(tracker.check_heartbeats().await.is_empty());

        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Dead);
        assert!(record.error.unwrap().contains("heartbeat"));
        assert_eq!(record.current_phase, ExecutionPhase::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_execution_not_declared_dead() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let id = tracker
            .create_execution(ExecutionRequest::new("triage", "user-1", "thread-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.check_heartbeats().await.is_empty());
        assert_eq!(tracker.get_execution(&id).await.unwrap().state, ExecutionState::Pending);
    }

    #[tokio::test]
    async fn test_timeout_notifies_default_bridge() {
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = ExecutionTracker::builder(fast_config())
            .notifier(notifier.clone())
            .build()
            .unwrap();

        let id = tracker
            .create_execution(
                ExecutionRequest::new("triage", "user-1", "thread-1").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        tracker.start_execution(&id).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(tracker.check_timeout(&id).await);
        assert!(!tracker.check_timeout(&id).await);

        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Timeout);
        assert!(record.error.as_deref().unwrap().contains("timeout"));
        assert!(record.phase_history.last().unwrap().notification_sent);
        assert_eq!(notifier.kinds().await, vec![NotificationKind::AgentTimeout]);
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_block_transition() {
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let id = running(&tracker).await;

        assert!(
            tracker
                .transition_state(&id, ExecutionPhase::Thinking, ExecutionMetadata::new(), Some(&notifier))
                .await
        );
        let record = tracker.get_execution(&id).await.unwrap();
        assert_eq!(record.current_phase, ExecutionPhase::Thinking);
        let entry = &record.phase_history[0];
        assert!(!entry.notification_sent);
        assert!(entry.notification_error.as_deref().unwrap().contains("bridge unavailable"));
    }

    #[tokio::test]
    async fn test_release_only_finished_executions() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let id = running(&tracker).await;
        assert!(tracker.register_circuit_breaker(&id).await);

        assert!(!tracker.release_execution(&id).await);
        tracker.fail_execution(&id, "tool crashed").await;
        assert!(tracker.release_execution(&id).await);

        assert!(tracker.get_execution(&id).await.is_none());
        assert!(tracker.circuit_breaker_status(&id).await.is_none());
        let ids = tracker.id_manager();
        assert!(!ids.is_active(&id));
        assert_eq!(ids.get_metadata(&id).unwrap().context["agent_name"], "triage");
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let config = TrackerConfig {
            retention: Duration::from_millis(50),
            ..fast_config()
        };
        let tracker = ExecutionTracker::new(config).unwrap();
        let done = running(&tracker).await;
        let live = running(&tracker).await;
        tracker.cancel_execution(&done, "user closed tab").await;

        assert_eq!(tracker.cleanup_completed().await, 0);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(tracker.cleanup_completed().await, 1);
        assert!(tracker.get_execution(&done).await.is_none());
        assert!(tracker.get_execution(&live).await.is_some());
    }

    #[tokio::test]
    async fn test_monitoring_start_stop() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        tracker.start_monitoring().await;
        tracker.start_monitoring().await;
        assert!(tracker.is_monitoring().await);

        let id = running(&tracker).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(tracker.get_execution(&id).await.unwrap().state, ExecutionState::Dead);

        tokio::time::timeout(Duration::from_secs(1), tracker.stop_monitoring())
            .await
            .unwrap();
        assert!(!tracker.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_panicking_bridge_does_not_skip_death_callbacks() {
        let notifier = Arc::new(RecordingNotifier {
            panic: true,
            ..Default::default()
        });
        let tracker = ExecutionTracker::builder(fast_config())
            .notifier(notifier.clone())
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tracker
            .register_death_callback(move |_record| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        let first = running(&tracker).await;
        let second = running(&tracker).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut dead = tracker.check_heartbeats().await;
        dead.sort();
        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(dead, expected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.kinds().await.len(), 2);

        let entry = tracker.get_execution(&first).await.unwrap().phase_history.pop().unwrap();
        assert_eq!(entry.to_phase, ExecutionPhase::Failed);
        assert!(!entry.notification_sent);
        assert!(entry.notification_error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_malformed_request_config_is_rejected() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();

        let zero_threshold = TimeoutConfig {
            failure_threshold: 0,
            ..TimeoutConfig::default()
        };
        let zero_llm_timeout = TimeoutConfig {
            llm_api_timeout: Duration::ZERO,
            ..TimeoutConfig::default()
        };
        for request in [
            ExecutionRequest::new("triage", "user-1", "thread-1").with_timeout_config(zero_threshold),
            ExecutionRequest::new("triage", "user-1", "thread-1").with_timeout_config(zero_llm_timeout),
            ExecutionRequest::new("triage", "user-1", "thread-1").with_timeout(Duration::ZERO),
        ] {
            assert!(matches!(
                tracker.create_execution(request).await,
                Err(TrackerError::Configuration(_))
            ));
        }

        assert!(tracker.get_active_executions().await.is_empty());
        assert_eq!(tracker.get_metrics().total_executions, 0);
        assert_eq!(tracker.get_id_stats().total_registered, 0);
    }

    #[tokio::test]
    async fn test_created_event_follows_registration() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let mut events = tracker.subscribe();

        let id = tracker
            .create_execution(ExecutionRequest::new("triage", "user-1", "thread-1"))
            .await
            .unwrap();
        let ExecutionEvent::Created(record) = events.recv().await.unwrap() else {
            panic!("expected a created event");
        };
        assert_eq!(record.execution_id, id);
        assert!(tracker.get_execution(&record.execution_id).await.is_some());
    }

    #[tokio::test]
    async fn test_complete_from_completing() {
        let tracker = ExecutionTracker::new(fast_config()).unwrap();
        let id = running(&tracker).await;
        assert!(
            tracker
                .update_execution_state(&id, ExecutionState::Completing, None, None)
                .await
        );
        assert!(tracker.complete_execution(&id, json!("ok")).await);
        assert_eq!(tracker.get_execution(&id).await.unwrap().state, ExecutionState::Completed);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TrackerConfig {
            heartbeat_timeout: Duration::ZERO,
            ..TrackerConfig::default()
        };
        assert!(matches!(
            ExecutionTracker::new(config),
            Err(TrackerError::Configuration(_))
        ));
    }
}
