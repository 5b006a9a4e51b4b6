//! Agent Execution Tracker - lifecycle control plane for agent runs
//!
//! Keeps every agent execution observable so users are never left waiting on
//! a task that died silently:
//! - State machine for coarse execution state and fine-grained phases
//! - Heartbeat death detection and wall-clock timeouts (background sweeps)
//! - Per-execution circuit breakers for external calls
//! - Notification bridge for real-time progress events
//! - Structured identifiers with lifecycle tracking
//! - Prometheus metrics and tracing spans

pub mod callbacks;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod execution_record;
pub mod execution_tracker;
pub mod id_manager;
pub mod metrics;
mod monitor;
pub mod notifier;
pub mod state_machine;
pub mod telemetry;
pub mod user_scope;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use config::{TimeoutConfig, TrackerConfig};
pub use error::{Result, TrackerError};
pub use execution_record::{ExecutionMetadata, ExecutionRecord, ExecutionRequest, PhaseTransition};
pub use execution_tracker::{ExecutionEvent, ExecutionTracker, TrackerBuilder};
pub use id_manager::{IdManager, IdMetadata, IdStats, IdType};
pub use metrics::{ExecutionMetrics, MetricsSnapshot};
pub use notifier::{NotificationBridge, NotificationKind, SharedNotifier};
pub use state_machine::{is_valid_transition, ExecutionPhase, ExecutionState};
pub use telemetry::ExecutionTelemetry;
pub use user_scope::UserScope;
