//! Supervised pool of background tasks sharing one cancellation root.
use std::{future::Future, time::Duration};

use futures_util::FutureExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("routine pool did not stop within {0:?}")]
    Timeout(Duration),
}

/// Background task pool.
///
/// Every task receives a child of the pool's token. A panic inside a task is caught and
/// logged; it never takes down the runtime worker or the other tasks.
#[derive(Clone, Debug)]
pub struct RoutinePool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl RoutinePool {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn a task that receives the pool's cancellation token.
    pub fn go_ctx<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = f(self.token.child_token());
        self.tracker.spawn(async move {
            if let Err(payload) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                tracing::error!(
                    routine = name,
                    panic = %message,
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "Routine panicked"
                );
            }
        });
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancel every task and wait for all of them, bounded by `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), PoolError> {
        self.token.cancel();
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .map_err(|_| PoolError::Timeout(timeout))
    }
}
