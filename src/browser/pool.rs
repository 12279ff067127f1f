//! Idle browser pools keyed by capability fingerprint.
//!
//! Released browsers stay alive in a per-fingerprint pool and get reused by
//! later sessions with equivalent capabilities. Entries are evicted when they
//! outlive `max_age`, sit idle past `idle_timeout`, or would push the pool
//! over `max_idle`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::browser::{Browser, BrowserAllocator, BrowserHandle};
use crate::capabilities::{pool_key, CapsHandle};
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_age: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: 0,
            max_age: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

struct IdleEntry {
    browser: BrowserHandle,
    created: Instant,
    timer: JoinHandle<()>,
}

struct PoolState {
    entries: HashMap<Uuid, IdleEntry>,
    shutdown: bool,
}

/// Pool of idle browsers sharing one fingerprint.
pub struct IdlePool {
    name: String,
    allocator: Arc<dyn BrowserAllocator>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl IdlePool {
    pub fn new(name: String, allocator: Arc<dyn BrowserAllocator>, config: PoolConfig) -> Arc<Self> {
        tracing::info!(
            pool = %name,
            max_idle = config.max_idle,
            max_age = ?config.max_age,
            idle_timeout = ?config.idle_timeout,
            "starting pool"
        );
        Arc::new(IdlePool {
            name,
            allocator,
            config,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                shutdown: false,
            }),
        })
    }

    /// Take an idle browser if one exists, otherwise allocate a fresh one.
    /// Either way the returned handle checks back in on `close(false)`.
    pub async fn checkout(
        self: &Arc<Self>,
        protocol: Protocol,
        caps: CapsHandle,
        cancel: CancellationToken,
    ) -> Result<BrowserHandle> {
        if let Some((id, entry)) = self.pop_idle()? {
            tracing::debug!(pool = %self.name, browser_id = %id, "checking out idle browser");
            return Ok(Arc::new(PooledBrowser {
                id,
                inner: entry.browser,
                created: entry.created,
                pool: Arc::downgrade(self),
            }));
        }

        let browser = self.allocator.allocate(protocol, caps, cancel).await?;
        Ok(Arc::new(PooledBrowser {
            id: Uuid::new_v4(),
            inner: browser,
            created: Instant::now(),
            pool: Arc::downgrade(self),
        }))
    }

    fn pop_idle(&self) -> Result<Option<(Uuid, IdleEntry)>> {
        let mut st = self.state.lock().expect("pool lock poisoned");
        if st.shutdown {
            return Err(Error::internal(format!("pool [{}] is shut down", self.name)));
        }
        let id = match st.entries.keys().next() {
            Some(id) => *id,
            None => return Ok(None),
        };
        let entry = st.entries.remove(&id).expect("entry disappeared under lock");
        entry.timer.abort();
        Ok(Some((id, entry)))
    }

    async fn checkin(self: Arc<Self>, id: Uuid, browser: BrowserHandle, created: Instant) {
        let age = created.elapsed();
        let keep = {
            let mut st = self.state.lock().expect("pool lock poisoned");
            if st.shutdown || st.entries.len() >= self.config.max_idle {
                tracing::debug!(
                    pool = %self.name,
                    browser_id = %id,
                    idle = st.entries.len(),
                    shutdown = st.shutdown,
                    "dropping browser"
                );
                false
            } else if age > self.config.max_age {
                tracing::debug!(pool = %self.name, browser_id = %id, ?age, "recycling aged browser");
                false
            } else {
                let timeout = (self.config.max_age - age).min(self.config.idle_timeout);
                let pool = Arc::downgrade(&self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(pool) = pool.upgrade() {
                        pool.evict(id).await;
                    }
                });
                tracing::debug!(pool = %self.name, browser_id = %id, "checking in browser");
                st.entries.insert(
                    id,
                    IdleEntry {
                        browser: browser.clone(),
                        created,
                        timer,
                    },
                );
                true
            }
        };

        if !keep {
            browser.close(true).await;
        }
    }

    async fn evict(&self, id: Uuid) {
        let entry = {
            let mut st = self.state.lock().expect("pool lock poisoned");
            st.entries.remove(&id)
        };
        if let Some(entry) = entry {
            tracing::debug!(pool = %self.name, browser_id = %id, "evicting idle browser");
            entry.browser.close(true).await;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").entries.len()
    }

    /// Stop the pool: no further checkouts, every idle browser is destroyed
    /// in parallel, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let entries: Vec<IdleEntry> = {
            let mut st = self.state.lock().expect("pool lock poisoned");
            st.shutdown = true;
            st.entries.drain().map(|(_, entry)| entry).collect()
        };
        tracing::info!(pool = %self.name, count = entries.len(), "shutting down pool");

        let closes = entries.into_iter().map(|entry| {
            entry.timer.abort();
            async move { entry.browser.close(true).await }
        });
        tokio::time::timeout(timeout, futures::future::join_all(closes))
            .await
            .map_err(|_| Error::internal(format!("pool [{}] shutdown timed out", self.name)))?;
        Ok(())
    }
}

/// Handle returned from a pool. Closing with `trash = false` re-enters the
/// pool; the pool itself only ever stores plain entries, so the wrapper owns
/// no state beyond its identity.
struct PooledBrowser {
    id: Uuid,
    inner: BrowserHandle,
    created: Instant,
    pool: Weak<IdlePool>,
}

#[async_trait]
impl Browser for PooledBrowser {
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
        if trash {
            self.inner.close(true).await;
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => {
                pool.checkin(self.id, Arc::clone(&self.inner), self.created)
                    .await
            }
            None => self.inner.close(true).await,
        }
    }
}

struct ManagerState {
    pools: HashMap<String, Arc<IdlePool>>,
    shutdown: bool,
}

/// Owns one [`IdlePool`] per capability fingerprint, creating pools lazily on
/// first use.
pub struct PoolManager {
    allocator: Arc<dyn BrowserAllocator>,
    config: PoolConfig,
    state: RwLock<ManagerState>,
}

impl PoolManager {
    pub fn new(allocator: Arc<dyn BrowserAllocator>, config: PoolConfig) -> Arc<Self> {
        Arc::new(PoolManager {
            allocator,
            config,
            state: RwLock::new(ManagerState {
                pools: HashMap::new(),
                shutdown: false,
            }),
        })
    }

    fn pool(&self, name: &str) -> Result<Arc<IdlePool>> {
        {
            let st = self.state.read().expect("pool manager lock poisoned");
            if st.shutdown {
                return Err(Error::internal("pool manager was shut down"));
            }
            if let Some(pool) = st.pools.get(name) {
                return Ok(Arc::clone(pool));
            }
        }

        let mut st = self.state.write().expect("pool manager lock poisoned");
        if st.shutdown {
            return Err(Error::internal("pool manager was shut down"));
        }
        // re-check after the lock upgrade
        if let Some(pool) = st.pools.get(name) {
            return Ok(Arc::clone(pool));
        }
        let pool = IdlePool::new(name.to_string(), Arc::clone(&self.allocator), self.config);
        st.pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Shut down every pool in parallel, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let pools: Vec<Arc<IdlePool>> = {
            let mut st = self.state.write().expect("pool manager lock poisoned");
            st.shutdown = true;
            st.pools.values().cloned().collect()
        };
        let shutdowns = pools.iter().map(|pool| pool.shutdown(timeout));
        for res in futures::future::join_all(shutdowns).await {
            res?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserAllocator for PoolManager {
    async fn allocate(
        &self,
        protocol: Protocol,
        caps: CapsHandle,
        cancel: CancellationToken,
    ) -> Result<BrowserHandle> {
        let name = pool_key(protocol, caps.as_ref());
        let pool = self.pool(&name)?;
        pool.checkout(protocol, caps, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pw_caps, MockAllocator};

    fn config(max_idle: usize) -> PoolConfig {
        PoolConfig {
            max_idle,
            max_age: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn released_browser_is_reused() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new("p".into(), allocator.clone(), config(1));

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        let a_url = a.url().clone();
        a.close(false).await;
        assert_eq!(pool.idle_count(), 1);

        let again = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.url(), &a_url);
        assert_eq!(allocator.created(), 1);
    }

    #[tokio::test]
    async fn idle_count_never_exceeds_max_idle() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new("p".into(), allocator.clone(), config(1));

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        let a_url = a.url().clone();
        let b = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(allocator.created(), 2);

        a.close(false).await;
        assert_eq!(pool.idle_count(), 1);
        // pool is full: the second release trashes its browser
        b.close(false).await;
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(allocator.closed(), 1);

        // the survivor is the first one back in
        let next = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next.url(), &a_url);
        assert_eq!(allocator.created(), 2);
    }

    #[tokio::test]
    async fn aged_browser_is_trashed_on_checkin() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new(
            "p".into(),
            allocator.clone(),
            PoolConfig {
                max_idle: 1,
                max_age: Duration::from_millis(10),
                idle_timeout: Duration::from_secs(60),
            },
        );

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close(false).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(allocator.closed(), 1);
    }

    #[tokio::test]
    async fn idle_timer_evicts_browser() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new(
            "p".into(),
            allocator.clone(),
            PoolConfig {
                max_idle: 1,
                max_age: Duration::from_secs(60),
                idle_timeout: Duration::from_millis(20),
            },
        );

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        a.close(false).await;
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(allocator.closed(), 1);
    }

    #[tokio::test]
    async fn checkout_disarms_eviction_timer() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new(
            "p".into(),
            allocator.clone(),
            PoolConfig {
                max_idle: 1,
                max_age: Duration::from_secs(60),
                idle_timeout: Duration::from_millis(50),
            },
        );

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        a.close(false).await;

        let reused = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // the timer must not have fired against the checked-out browser
        assert_eq!(allocator.closed(), 0);
        reused.close(true).await;
        assert_eq!(allocator.closed(), 1);
    }

    #[tokio::test]
    async fn shutdown_trashes_idle_and_blocks_checkout() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new("p".into(), allocator.clone(), config(2));

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        a.close(false).await;

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(allocator.closed(), 1);
        assert!(pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn checkin_after_shutdown_trashes() {
        let allocator = Arc::new(MockAllocator::new());
        let pool = IdlePool::new("p".into(), allocator.clone(), config(2));

        let a = pool
            .checkout(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        a.close(false).await;
        assert_eq!(allocator.closed(), 1);
    }

    #[tokio::test]
    async fn manager_routes_same_fingerprint_to_same_pool() {
        let allocator = Arc::new(MockAllocator::new());
        let manager = PoolManager::new(allocator.clone(), config(1));

        let a = manager
            .allocate(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        let a_url = a.url().clone();
        a.close(false).await;

        // same fingerprint reuses, a different browser allocates fresh
        let again = manager
            .allocate(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.url(), &a_url);
        let other = manager
            .allocate(Protocol::Webdriver, pw_caps("firefox"), CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(other.url(), &a_url);
        assert_eq!(allocator.created(), 2);
    }

    #[tokio::test]
    async fn manager_shutdown_rejects_allocation() {
        let allocator = Arc::new(MockAllocator::new());
        let manager = PoolManager::new(allocator.clone(), config(1));

        let a = manager
            .allocate(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        a.close(false).await;

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(allocator.closed(), 1);
        assert!(manager
            .allocate(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .is_err());
    }
}
