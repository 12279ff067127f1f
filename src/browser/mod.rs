//! Browser workload abstraction and the allocator chain.
//!
//! A [`Browser`] is an opaque handle to one running workload (container or
//! pod). Allocators produce handles; the chain layered at startup is
//! quota authorizer -> idle pool manager -> backend allocator, every layer
//! preserving the same [`BrowserAllocator`] contract.

pub mod docker;
pub mod kubernetes;
pub mod pool;
pub mod quota;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::capabilities::CapsHandle;
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};

/// Handle to one running browser workload.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Canonical URL of the primary protocol endpoint.
    fn url(&self) -> &Url;

    /// Display host (`host:port`) used for the upstream `Host` header.
    fn host(&self) -> &str;

    /// `host:port` address of a side channel, if the workload exposes it.
    fn host_port(&self, port: ContainerPort) -> Option<String>;

    /// Release the workload. `trash = true` destroys it; `trash = false`
    /// returns it to the pool when one is layered in (backends treat both
    /// the same).
    async fn close(&self, trash: bool);
}

pub type BrowserHandle = Arc<dyn Browser>;

impl std::fmt::Debug for dyn Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Browser").field("host", &self.host()).finish()
    }
}

#[async_trait]
pub trait BrowserAllocator: Send + Sync {
    /// Provision one workload. `cancel` is the caller's request-scoped
    /// cancellation signal: it fires when the client goes away and every
    /// layer must stop waiting on it, while any work already in flight
    /// cleans up after itself.
    async fn allocate(
        &self,
        protocol: Protocol,
        caps: CapsHandle,
        cancel: CancellationToken,
    ) -> Result<BrowserHandle>;
}

/// Destroy a browser on a detached task so client cancellation cannot leak
/// the workload. This is the contract of every trash path.
pub fn trash_detached(browser: BrowserHandle) {
    tokio::spawn(async move {
        browser.close(true).await;
    });
}

/// Allocate with a deadline without losing the workload when the caller goes
/// away: the allocation runs on its own task, and if the result can no longer
/// be delivered (deadline hit, client disconnected) a successfully allocated
/// browser is trashed by that task. Cancellation returns immediately while
/// the allocation keeps running in the background.
pub async fn allocate_bounded(
    allocator: Arc<dyn BrowserAllocator>,
    protocol: Protocol,
    caps: CapsHandle,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<BrowserHandle> {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = tokio::sync::oneshot::channel();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let res = allocator.allocate(protocol, caps, task_cancel).await;
        if let Err(res) = tx.send(res) {
            if let Ok(browser) = res {
                browser.close(true).await;
            }
        }
    });

    tokio::select! {
        res = rx => match res {
            Ok(res) => res,
            Err(_) => Err(Error::internal("allocation task failed")),
        },
        _ = tokio::time::sleep_until(deadline.into()) => Err(Error::gateway_timeout(format!(
            "allocation deadline exceeded after {timeout:?}"
        ))),
        _ = cancel.cancelled() => Err(Error::canceled(
            "canceled while allocation is in progress",
        )),
    }
}
