//! Ordered graceful shutdown on SIGINT/SIGTERM.
//!
//! Components register hooks under an opaque group key. On the first signal
//! all groups run concurrently while hooks inside one group run sequentially
//! in reverse registration order, the whole teardown bounded by one global
//! deadline. A second signal aborts immediately.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::signal::unix::{signal, SignalKind};

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, crate::error::Result<()>> + Send>;

pub struct ShutdownCoordinator {
    hooks: Mutex<HashMap<String, Vec<Hook>>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        ShutdownCoordinator {
            hooks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a hook. Hooks in the same group run sequentially in reverse
    /// registration order; groups run concurrently.
    pub fn register<F>(&self, group: &str, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, crate::error::Result<()>> + Send + 'static,
    {
        self.hooks
            .lock()
            .expect("shutdown lock poisoned")
            .entry(group.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    /// Block until a termination signal arrives, then run the registered
    /// hooks. Returns the process exit code: 0 on a clean teardown, 1 when
    /// the deadline passes or a second signal arrives.
    pub async fn run(self) -> i32 {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGINT handler");
                return 1;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return 1;
            }
        };

        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = name, "signal caught, shutting down...");

        let start = Instant::now();
        let teardown = self.run_hooks();
        tokio::pin!(teardown);

        tokio::select! {
            _ = &mut teardown => {
                tracing::info!(elapsed = ?start.elapsed(), "graceful shutdown completed");
                0
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(
                    timeout = ?self.timeout,
                    "shutdown hooks did not complete in time, exiting immediately"
                );
                1
            }
            _ = sigint.recv() => {
                tracing::info!("second signal caught, exiting immediately");
                1
            }
            _ = sigterm.recv() => {
                tracing::info!("second signal caught, exiting immediately");
                1
            }
        }
    }

    /// Run every group concurrently; within a group, reverse registration
    /// order, sequentially.
    async fn run_hooks(&self) {
        let groups: Vec<(String, Vec<Hook>)> = {
            let mut hooks = self.hooks.lock().expect("shutdown lock poisoned");
            hooks.drain().collect()
        };

        let tasks = groups.into_iter().map(|(group, hooks)| async move {
            for hook in hooks.into_iter().rev() {
                if let Err(err) = hook().await {
                    tracing::warn!(group = %group, error = %err, "shutdown hook failed");
                }
            }
        });
        futures::future::join_all(tasks).await;
    }
}
