//! Background sweeps: heartbeat death detection, timeouts, cleanup
//!
//! Each loop holds only a weak reference to the tracker and exits when the
//! tracker is dropped or the shared shutdown signal fires.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::execution_tracker::{ExecutionTracker, TrackerInner};

pub(crate) struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn spawn(inner: &Arc<TrackerInner>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let config = inner.config.clone();
        let weak = Arc::downgrade(inner);

        let tasks = vec![
            spawn_sweep("heartbeat", config.heartbeat_check_interval, weak.clone(), rx.clone(), |tracker| async move {
                tracker.check_heartbeats().await;
            }),
            spawn_sweep("timeout", config.timeout_check_interval, weak.clone(), rx.clone(), |tracker| async move {
                tracker.check_timeouts().await;
            }),
            spawn_sweep("cleanup", config.cleanup_interval, weak, rx, |tracker| async move {
                tracker.cleanup_completed().await;
            }),
        ];

        info!(
            heartbeat_interval_ms = config.heartbeat_check_interval.as_millis() as u64,
            timeout_interval_ms = config.timeout_check_interval.as_millis() as u64,
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            "Execution monitoring started"
        );

        Self { shutdown, tasks }
    }

    /// Signal every loop and wait until all of them have exited.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Monitor task ended abnormally");
            }
        }
        info!("Execution monitoring stopped");
    }
}

fn spawn_sweep<F, Fut>(
    name: &'static str,
    interval: Duration,
    tracker: Weak<TrackerInner>,
    mut shutdown: watch::Receiver<bool>,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn(ExecutionTracker) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let Some(inner) = tracker.upgrade() else { break };
                    let run = sweep(ExecutionTracker::from_inner(inner));
                    if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                        error!(monitor = name, "Sweep panicked, continuing with next interval");
                    }
                }
            }
        }
        debug!(monitor = name, "Monitor loop exited");
    })
}
