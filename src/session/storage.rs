//! In-memory session storage, partitioned by protocol.
//!
//! Shutdown is monotonic: once the storage starts draining, no new sessions
//! are accepted and every stored browser is destroyed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::Protocol;
use crate::error::{Error, Result};
use crate::session::Session;

struct StorageState {
    sessions: HashMap<Protocol, HashMap<String, Arc<Session>>>,
    shutdown: bool,
}

pub struct SessionStorage {
    state: Mutex<StorageState>,
}

impl SessionStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionStorage {
            state: Mutex::new(StorageState {
                sessions: HashMap::new(),
                shutdown: false,
            }),
        })
    }

    pub fn add(&self, protocol: Protocol, session: Arc<Session>) -> Result<()> {
        let mut st = self.state.lock().expect("storage lock poisoned");
        if st.shutdown {
            return Err(Error::StorageShutdown);
        }
        st.sessions
            .entry(protocol)
            .or_default()
            .insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, protocol: Protocol, id: &str) -> Option<Arc<Session>> {
        let st = self.state.lock().expect("storage lock poisoned");
        st.sessions.get(&protocol)?.get(id).cloned()
    }

    /// Snapshot of the sessions for one protocol.
    pub fn list(&self, protocol: Protocol) -> Vec<Arc<Session>> {
        let st = self.state.lock().expect("storage lock poisoned");
        st.sessions
            .get(&protocol)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a session; returns false when it was already gone.
    pub fn delete(&self, protocol: Protocol, id: &str) -> bool {
        let mut st = self.state.lock().expect("storage lock poisoned");
        st.sessions
            .get_mut(&protocol)
            .map(|sessions| sessions.remove(id).is_some())
            .unwrap_or(false)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().expect("storage lock poisoned").shutdown
    }

    /// Flip into draining mode and trash every stored browser in parallel,
    /// bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let drained: Vec<Arc<Session>> = {
            let mut st = self.state.lock().expect("storage lock poisoned");
            st.shutdown = true;
            let mut drained = Vec::new();
            for (protocol, sessions) in st.sessions.drain() {
                tracing::info!(
                    protocol = %protocol,
                    count = sessions.len(),
                    "session storage is shutting down, invalidating sessions"
                );
                drained.extend(sessions.into_values());
            }
            drained
        };

        let closes = drained
            .iter()
            .map(|session| session.browser().close(true));
        tokio::time::timeout(timeout, futures::future::join_all(closes))
            .await
            .map_err(|_| Error::internal("session storage shutdown timed out"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserAllocator;
    use crate::testing::{pw_caps, MockAllocator};
    use tokio_util::sync::CancellationToken;

    async fn session(allocator: &MockAllocator, id: &str) -> Arc<Session> {
        let browser = allocator
            .allocate(Protocol::Webdriver, pw_caps("chrome"), CancellationToken::new())
            .await
            .unwrap();
        Arc::new(Session::new(
            id.to_string(),
            "LINUX".to_string(),
            browser,
            pw_caps("chrome"),
            None,
            None,
        ))
    }

    #[tokio::test]
    async fn add_get_list_delete() {
        let allocator = MockAllocator::new();
        let storage = SessionStorage::new();

        storage
            .add(Protocol::Webdriver, session(&allocator, "a").await)
            .unwrap();
        storage
            .add(Protocol::Playwright, session(&allocator, "b").await)
            .unwrap();

        assert!(storage.get(Protocol::Webdriver, "a").is_some());
        // partitions are independent
        assert!(storage.get(Protocol::Playwright, "a").is_none());
        assert_eq!(storage.list(Protocol::Webdriver).len(), 1);

        assert!(storage.delete(Protocol::Webdriver, "a"));
        assert!(!storage.delete(Protocol::Webdriver, "a"));
        assert!(storage.list(Protocol::Webdriver).is_empty());
    }

    #[tokio::test]
    async fn shutdown_trashes_all_and_rejects_adds() {
        let allocator = MockAllocator::new();
        let storage = SessionStorage::new();
        storage
            .add(Protocol::Webdriver, session(&allocator, "a").await)
            .unwrap();
        storage
            .add(Protocol::Playwright, session(&allocator, "b").await)
            .unwrap();

        storage.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(allocator.closed(), 2);
        assert!(storage.is_shutdown());

        let err = storage
            .add(Protocol::Webdriver, session(&allocator, "c").await)
            .unwrap_err();
        assert!(matches!(err, Error::StorageShutdown));
    }
}
