//! Observer lists for death, timeout and circuit breaker events
//!
//! Every handler runs inside its own caught scope: errors, panics and
//! handlers that outlive the notification timeout are logged and dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreakerStatus;
use crate::execution_record::ExecutionRecord;

pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Handler receiving a snapshot of the finalized execution
pub type ExecutionCallback = Arc<dyn Fn(ExecutionRecord) -> CallbackFuture + Send + Sync>;

/// Handler receiving the execution id and the breaker status after it opened
pub type CircuitBreakerCallback = Arc<dyn Fn(String, CircuitBreakerStatus) -> CallbackFuture + Send + Sync>;

pub(crate) fn execution_callback<F, Fut>(handler: F) -> ExecutionCallback
where
    F: Fn(ExecutionRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |record: ExecutionRecord| -> CallbackFuture { handler(record).boxed() })
}

pub(crate) fn circuit_breaker_callback<F, Fut>(handler: F) -> CircuitBreakerCallback
where
    F: Fn(String, CircuitBreakerStatus) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |id: String, status: CircuitBreakerStatus| -> CallbackFuture {
        handler(id, status).boxed()
    })
}

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    pub death: Vec<ExecutionCallback>,
    pub timeout: Vec<ExecutionCallback>,
    pub circuit_breaker: Vec<CircuitBreakerCallback>,
}

/// Await one handler. Returns true when it finished cleanly.
pub(crate) async fn run_guarded(kind: &str, execution_id: &str, fut: CallbackFuture, limit: Duration) -> bool {
    match tokio::time::timeout(limit, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            error!(execution_id = %execution_id, callback = kind, error = %e, "Callback failed");
            false
        }
        Ok(Err(_)) => {
            error!(execution_id = %execution_id, callback = kind, "Callback panicked");
            false
        }
        Err(_) => {
            warn!(execution_id = %execution_id, callback = kind, limit_ms = limit.as_millis() as u64, "Callback timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_guarded_contains_failures() {
        let limit = Duration::from_millis(50);

        let ok = async { Ok::<(), anyhow::Error>(()) }.boxed();
        assert!(run_guarded("death", "e1", ok, limit).await);

        let failing = async { Err::<(), _>(anyhow::anyhow!("nope")) }.boxed();
        assert!(!run_guarded("death", "e1", failing, limit).await);

        let panicking = async move {
            if limit > Duration::ZERO {
                panic!("handler bug");
            }
            Ok::<(), anyhow::Error>(())
        }
        .boxed();
        assert!(!run_guarded("death", "e1", panicking, limit).await);

        let hanging = async {
            std::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        }
        .boxed();
        assert!(!run_guarded("death", "e1", hanging, limit).await);
    }
}
