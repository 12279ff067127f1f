//! Global concurrency quota with a bounded FIFO wait queue.
//!
//! [`QuotaAuthorizer`] is the gate itself; [`QuotaAllocator`] layers it over
//! any [`BrowserAllocator`] so that a slot is reserved before allocation and
//! released exactly once when the browser closes.
//!
//! A waiter that gets a slot handed over by [`QuotaAuthorizer::release`]
//! takes ownership of that slot: the releasing side keeps `allocated`
//! unchanged on its behalf. Waiters abandoned mid-wait (timeout, cancel, or
//! the future being dropped) either leave the queue or, when a grant raced
//! in, hand the slot straight back.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::browser::{Browser, BrowserAllocator, BrowserHandle};
use crate::capabilities::CapsHandle;
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};

enum WaitState {
    Waiting(Option<Waker>),
    Granted,
}

struct State {
    allocated: usize,
    queue: VecDeque<u64>,
    waiters: HashMap<u64, WaitState>,
    next_id: u64,
}

/// Bounded concurrency gate with strict FIFO admission.
pub struct QuotaAuthorizer {
    limit: usize,
    queue_limit: usize,
    state: Mutex<State>,
}

impl QuotaAuthorizer {
    pub fn new(limit: usize, queue_limit: usize) -> Self {
        tracing::info!(limit, queue_limit, "initializing quota");
        QuotaAuthorizer {
            limit,
            queue_limit,
            state: Mutex::new(State {
                allocated: 0,
                queue: VecDeque::new(),
                waiters: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().expect("quota lock poisoned").allocated
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().expect("quota lock poisoned").queue.len()
    }

    /// Reserve one slot, waiting in the FIFO queue for at most `timeout`.
    ///
    /// Fails with quota-exceeded when the queue is full or the wait times
    /// out, and with canceled when `cancel` fires first. A grant racing the
    /// timeout or cancellation is still honored.
    pub async fn reserve(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let id = {
            let mut st = self.state.lock().expect("quota lock poisoned");
            // Leave queued requests ahead of the new one: only take the fast
            // path when there is room for them all.
            if st.allocated + st.queue.len() < self.limit {
                st.allocated += 1;
                tracing::debug!(allocated = st.allocated, "quota reserved");
                return Ok(());
            }
            if st.queue.len() >= self.queue_limit {
                let reason = self.describe("quota exceeded", &st);
                return Err(Error::quota_exceeded(reason));
            }
            let id = st.next_id;
            st.next_id += 1;
            st.waiters.insert(id, WaitState::Waiting(None));
            st.queue.push_back(id);
            id
        };

        let mut guard = WaiterGuard {
            quota: self,
            id,
            done: false,
        };

        enum Outcome {
            Granted,
            TimedOut,
            Canceled,
        }

        let outcome = tokio::select! {
            _ = WaitForGrant { quota: self, id } => Outcome::Granted,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Canceled,
        };

        let mut st = self.state.lock().expect("quota lock poisoned");
        guard.done = true;
        match outcome {
            Outcome::Granted => {
                st.waiters.remove(&id);
                Ok(())
            }
            Outcome::TimedOut | Outcome::Canceled => {
                match st.waiters.remove(&id) {
                    // A grant arrived at the last moment: the slot is ours.
                    Some(WaitState::Granted) => Ok(()),
                    _ => {
                        st.queue.retain(|queued| *queued != id);
                        match outcome {
                            Outcome::TimedOut => {
                                let reason = self.describe("quota wait failed", &st);
                                Err(Error::quota_exceeded(reason))
                            }
                            _ => {
                                let reason = self.describe("quota wait canceled", &st);
                                Err(Error::canceled(reason))
                            }
                        }
                    }
                }
            }
        }
    }

    /// Release one slot: hand it to the queue head when someone is waiting,
    /// otherwise decrement the allocation count.
    pub fn release(&self) {
        let mut st = self.state.lock().expect("quota lock poisoned");
        Self::release_locked(&mut st);
    }

    fn release_locked(st: &mut State) {
        while let Some(id) = st.queue.pop_front() {
            if let Some(state) = st.waiters.get_mut(&id) {
                let prev = std::mem::replace(state, WaitState::Granted);
                if let WaitState::Waiting(waker) = prev {
                    tracing::debug!(allocated = st.allocated, queued = st.queue.len(),
                        "quota slot handed to queued waiter");
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return;
                }
            }
        }
        if st.allocated == 0 {
            tracing::warn!("quota underrun detected, keeping allocated at 0");
        } else {
            st.allocated -= 1;
            tracing::debug!(allocated = st.allocated, "quota released");
        }
    }

    fn describe(&self, msg: &str, st: &State) -> String {
        format!(
            "{msg}: allocated={}, limit={}, queue size={}",
            st.allocated,
            self.limit,
            st.queue.len()
        )
    }
}

struct WaitForGrant<'a> {
    quota: &'a QuotaAuthorizer,
    id: u64,
}

impl Future for WaitForGrant<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.quota.state.lock().expect("quota lock poisoned");
        match st.waiters.get_mut(&self.id) {
            Some(WaitState::Waiting(waker)) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            _ => Poll::Ready(()),
        }
    }
}

/// Returns an abandoned waiter's state on drop so a slot granted to a
/// disappearing client is never stranded.
struct WaiterGuard<'a> {
    quota: &'a QuotaAuthorizer,
    id: u64,
    done: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut st = self.quota.state.lock().expect("quota lock poisoned");
        match st.waiters.remove(&self.id) {
            Some(WaitState::Granted) => QuotaAuthorizer::release_locked(&mut st),
            Some(WaitState::Waiting(_)) => {
                let id = self.id;
                st.queue.retain(|queued| *queued != id);
            }
            None => {}
        }
    }
}

/// Allocator layer enforcing the quota around an inner allocator.
pub struct QuotaAllocator {
    inner: Arc<dyn BrowserAllocator>,
    quota: Arc<QuotaAuthorizer>,
    queue_timeout: Duration,
}

impl QuotaAllocator {
    pub fn new(
        inner: Arc<dyn BrowserAllocator>,
        quota: Arc<QuotaAuthorizer>,
        queue_timeout: Duration,
    ) -> Self {
        QuotaAllocator {
            inner,
            quota,
            queue_timeout,
        }
    }
}

#[async_trait]
impl BrowserAllocator for QuotaAllocator {
    async fn allocate(
        &self,
        protocol: Protocol,
        caps: CapsHandle,
        cancel: CancellationToken,
    ) -> Result<BrowserHandle> {
        self.quota.reserve(self.queue_timeout, &cancel).await?;

        match self.inner.allocate(protocol, caps, cancel).await {
            Ok(browser) => Ok(Arc::new(ReleasingBrowser {
                inner: browser,
                quota: Arc::clone(&self.quota),
                released: AtomicBool::new(false),
            })),
            Err(err) => {
                self.quota.release();
                Err(err)
            }
        }
    }
}

/// Browser wrapper that gives the quota slot back exactly once on close.
struct ReleasingBrowser {
    inner: BrowserHandle,
    quota: Arc<QuotaAuthorizer>,
    released: AtomicBool,
}

#[async_trait]
impl Browser for ReleasingBrowser {
    fn url(&self) -> &Url {
        self.inner.url()
    }

    fn host(&self) -> &str {
        self.inner.host()
    }

    fn host_port(&self, port: ContainerPort) -> Option<String> {
        self.inner.host_port(port)
    }

    async fn close(&self, trash: bool) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.quota.release();
        }
        self.inner.close(trash).await;
    }
}
