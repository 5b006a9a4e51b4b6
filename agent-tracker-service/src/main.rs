//! Agent Tracker Service
//!
//! Hosts a single execution tracker:
//! - Background heartbeat, timeout and cleanup sweeps
//! - Execution event stream written to the log
//! - Periodic metrics summary, Prometheus text dump on shutdown
//!
//! This binary is the embedding host only. Executions are created by the
//! agent runtime that links the `agent-tracker` crate and shares this
//! tracker; on its own the service just supervises an empty table.

use std::sync::Arc;
use std::time::Duration;

use agent_tracker::{ExecutionEvent, ExecutionTracker, TrackerConfig};
use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

mod bridge;

use bridge::LogBridge;

#[derive(Parser, Debug)]
#[command(name = "agent-tracker-service")]
#[command(about = "Agent execution tracker with heartbeat and timeout monitoring")]
struct Args {
    /// Seconds without a heartbeat before a started execution is declared dead
    #[arg(long)]
    heartbeat_timeout: Option<u64>,

    /// Default execution deadline in seconds
    #[arg(long)]
    execution_timeout: Option<u64>,

    /// Seconds between cleanup sweeps
    #[arg(long)]
    cleanup_interval: Option<u64>,

    /// Seconds between metrics summaries (0 disables)
    #[arg(long, default_value = "60")]
    metrics_interval: u64,

    /// Print Prometheus metrics to stdout on shutdown
    #[arg(long)]
    dump_metrics: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn tracker_config(&self) -> Result<TrackerConfig> {
        let mut config = TrackerConfig::from_env();
        if let Some(secs) = self.heartbeat_timeout {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.execution_timeout {
            config.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cleanup_interval {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,agent_tracker=debug".into());
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = args.tracker_config()?;
    info!(
        heartbeat_timeout_s = config.heartbeat_timeout.as_secs_f64(),
        execution_timeout_s = config.execution_timeout.as_secs_f64(),
        retention_s = config.retention.as_secs_f64(),
        "Starting Agent Tracker Service"
    );

    let tracker = ExecutionTracker::builder(config)
        .notifier(Arc::new(LogBridge))
        .service_name("agent-tracker-service")
        .build()?;

    tracker
        .register_death_callback(|record| async move {
            warn!(
                execution_id = %record.execution_id,
                agent_name = %record.agent_name,
                user_id = %record.user_id,
                "Agent died without finishing"
            );
            Ok::<(), anyhow::Error>(())
        })
        .await;
    tracker
        .register_circuit_breaker_callback(|execution_id, status| async move {
            warn!(
                execution_id = %execution_id,
                failures = status.failure_count,
                "External calls suspended for execution"
            );
            Ok::<(), anyhow::Error>(())
        })
        .await;

    tracker.start_monitoring().await;

    let events = tokio::spawn(log_events(tracker.clone()));
    let summaries = (args.metrics_interval > 0)
        .then(|| tokio::spawn(log_metrics(tracker.clone(), Duration::from_secs(args.metrics_interval))));

    shutdown_signal().await;

    tracker.stop_monitoring().await;
    events.abort();
    if let Some(summaries) = summaries {
        summaries.abort();
    }

    if args.dump_metrics {
        match tracker.metrics().gather_text() {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode metrics: {}", e),
        }
    }

    info!("Agent Tracker Service stopped");
    Ok(())
}

async fn log_events(tracker: ExecutionTracker) {
    let mut rx = tracker.subscribe();
    loop {
        match rx.recv().await {
            Ok(ExecutionEvent::Created(record)) => {
                debug!(execution_id = %record.execution_id, agent_name = %record.agent_name, "Execution created");
            }
            Ok(ExecutionEvent::StateChanged { execution_id, from, to }) => {
                info!(execution_id = %execution_id, from = %from, to = %to, "Execution state changed");
            }
            Ok(ExecutionEvent::PhaseChanged { execution_id, transition }) => {
                debug!(
                    execution_id = %execution_id,
                    from = %transition.from_phase,
                    to = %transition.to_phase,
                    "Execution phase changed"
                );
            }
            Ok(ExecutionEvent::Dead(record)) => {
                warn!(execution_id = %record.execution_id, error = ?record.error, "Execution dead");
            }
            Ok(ExecutionEvent::TimedOut(record)) => {
                warn!(execution_id = %record.execution_id, error = ?record.error, "Execution timed out");
            }
            Ok(ExecutionEvent::CircuitOpened { execution_id, status }) => {
                warn!(execution_id = %execution_id, state = %status.state, "Circuit breaker opened");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_metrics(tracker: ExecutionTracker, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        let metrics = tracker.get_metrics();
        let ids = tracker.get_id_stats();
        info!(
            total = metrics.total_executions,
            active = metrics.active_executions,
            succeeded = metrics.successful_executions,
            failed = metrics.failed_executions,
            timed_out = metrics.timeout_executions,
            dead = metrics.dead_executions,
            failure_rate = metrics.failure_rate,
            registered_ids = ids.total_registered,
            "Execution metrics"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
