//! Test doubles for the allocation pipeline.
//!
//! Provides:
//! - [`StubBrowser`]: an inert workload handle with a close counter
//! - [`MockAllocator`]: a backend allocator with create/close accounting,
//!   optional failure injection and artificial latency
//!
//! Used by the unit tests across the crate and by the integration tests to
//! drive session services without a container backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::browser::{Browser, BrowserAllocator, BrowserHandle};
use crate::capabilities::{CapsHandle, PlaywrightCapabilities};
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};

/// Playwright-shaped capabilities with just a browser name, enough for
/// fingerprinting and allocation in tests.
pub fn pw_caps(browser: &str) -> CapsHandle {
    Arc::new(PlaywrightCapabilities {
        browser: browser.to_string(),
        ..Default::default()
    })
}

/// Workload handle that counts closes and exposes a fixed address map.
pub struct StubBrowser {
    url: Url,
    host: String,
    ports: BTreeMap<ContainerPort, String>,
    closed: Arc<AtomicUsize>,
}

impl StubBrowser {
    pub fn new(url: Url, closed: Arc<AtomicUsize>) -> Self {
        let host = format!(
            "{}:{}",
            url.host_str().unwrap_or("localhost"),
            url.port().unwrap_or(80)
        );
        StubBrowser {
            url,
            host,
            ports: BTreeMap::new(),
            closed,
        }
    }

    pub fn with_port(mut self, port: ContainerPort, addr: &str) -> Self {
        self.ports.insert(port, addr.to_string());
        self
    }
}

#[async_trait]
impl Browser for StubBrowser {
    fn url(&self) -> &Url {
        &self.url
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn host_port(&self, port: ContainerPort) -> Option<String> {
        self.ports.get(&port).cloned()
    }

    async fn close(&self, _trash: bool) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend allocator double with create/close accounting.
pub struct MockAllocator {
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail_next: AtomicBool,
    delay: Option<Duration>,
    base_url: String,
    ports: BTreeMap<ContainerPort, String>,
}

impl MockAllocator {
    pub fn new() -> Self {
        MockAllocator {
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_next: AtomicBool::new(false),
            delay: None,
            base_url: "http://browser.test".to_string(),
            ports: BTreeMap::new(),
        }
    }

    /// Point allocated browsers at a real listener (e.g. a stub upstream).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_port(mut self, port: ContainerPort, addr: &str) -> Self {
        self.ports.insert(port, addr.to_string());
        self
    }

    /// Make the next allocate call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserAllocator for MockAllocator {
    // the mock never watches `cancel`: cancellation tests rely on the
    // allocation finishing late so trash-on-late-delivery is observable
    async fn allocate(
        &self,
        _protocol: Protocol,
        _caps: CapsHandle,
        _cancel: CancellationToken,
    ) -> Result<BrowserHandle> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::internal("allocation failed"));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let url = Url::parse(&format!("{}/{}", self.base_url, n))
            .map_err(|e| Error::internal(format!("bad mock url: {e}")))?;
        let mut browser = StubBrowser::new(url, Arc::clone(&self.closed));
        for (port, addr) in &self.ports {
            browser = browser.with_port(*port, addr);
        }
        Ok(Arc::new(browser))
    }
}
