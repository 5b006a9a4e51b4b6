use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::state_machine::ExecutionState;

/// Point-in-time view of the tracker counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub active_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub timeout_executions: u64,
    pub dead_executions: u64,
    pub cancelled_executions: u64,
    /// Share of executions that failed, timed out or died
    pub failure_rate: f64,
}

/// Execution metrics collector
#[derive(Clone)]
pub struct ExecutionMetrics {
    executions_created: IntCounter,
    active_executions: IntGauge,
    executions_succeeded: IntCounter,
    executions_failed: IntCounter,
    executions_timed_out: IntCounter,
    executions_dead: IntCounter,
    executions_cancelled: IntCounter,
    execution_duration: Histogram,
    heartbeats: IntCounter,
    phase_transitions: IntCounter,
    circuit_breaker_trips: IntCounter,
    notification_failures: IntCounter,
    registry: Registry,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ExecutionMetrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_executions = IntGauge::new(
            "agent_active_executions",
            "Number of currently live executions",
        )?;
        registry.register(Box::new(active_executions.clone()))?;

        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_execution_duration_seconds",
                "Duration of finished executions in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        registry.register(Box::new(execution_duration.clone()))?;

        Ok(Self {
            executions_created: counter(&registry, "agent_executions_created_total", "Total executions created")?,
            active_executions,
            executions_succeeded: counter(&registry, "agent_executions_succeeded_total", "Executions that completed")?,
            executions_failed: counter(&registry, "agent_executions_failed_total", "Executions that failed")?,
            executions_timed_out: counter(&registry, "agent_executions_timeout_total", "Executions that hit their deadline")?,
            executions_dead: counter(&registry, "agent_executions_dead_total", "Executions declared dead by heartbeat silence")?,
            executions_cancelled: counter(&registry, "agent_executions_cancelled_total", "Executions cancelled")?,
            execution_duration,
            heartbeats: counter(&registry, "agent_heartbeats_total", "Heartbeats received")?,
            phase_transitions: counter(&registry, "agent_phase_transitions_total", "Phase transitions applied")?,
            circuit_breaker_trips: counter(&registry, "agent_circuit_breaker_trips_total", "Times a breaker opened")?,
            notification_failures: counter(&registry, "agent_notification_failures_total", "Failed or timed out bridge notifications")?,
            registry,
        })
    }

    pub fn execution_created(&self) {
        self.executions_created.inc();
        self.active_executions.inc();
    }

    /// Count a terminal transition.
    pub fn execution_finished(&self, state: ExecutionState, duration_ms: u64) {
        match state {
            ExecutionState::Completed => self.executions_succeeded.inc(),
            ExecutionState::Failed => self.executions_failed.inc(),
            ExecutionState::Timeout => self.executions_timed_out.inc(),
            ExecutionState::Dead => self.executions_dead.inc(),
            ExecutionState::Cancelled => self.executions_cancelled.inc(),
            _ => return,
        }
        self.execution_duration.observe(duration_ms as f64 / 1000.0);
        self.active_executions.dec();
    }

    pub fn heartbeat(&self) {
        self.heartbeats.inc();
    }

    pub fn phase_transition(&self) {
        // Keep this lightweight to avoid high-cardinality labels.
        self.phase_transitions.inc();
    }

    pub fn circuit_breaker_opened(&self) {
        self.circuit_breaker_trips.inc();
    }

    pub fn notification_failed(&self) {
        self.notification_failures.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.executions_created.get();
        let failed = self.executions_failed.get();
        let timeout = self.executions_timed_out.get();
        let dead = self.executions_dead.get();

        let failure_rate = if total == 0 {
            0.0
        } else {
            (failed + timeout + dead) as f64 / total as f64
        };

        MetricsSnapshot {
            total_executions: total,
            active_executions: self.active_executions.get().max(0) as u64,
            successful_executions: self.executions_succeeded.get(),
            failed_executions: failed,
            timeout_executions: timeout,
            dead_executions: dead,
            cancelled_executions: self.executions_cancelled.get(),
            failure_rate,
        }
    }

    /// Get metrics registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
