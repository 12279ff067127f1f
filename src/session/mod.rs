//! Session model and the per-protocol session services.

pub mod playwright;
pub mod storage;
pub mod webdriver;

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::browser::BrowserHandle;
use crate::capabilities::CapsHandle;

pub use playwright::PlaywrightSessionService;
pub use storage::SessionStorage;
pub use webdriver::WebdriverSessionService;

/// One live browser session. Exists in storage iff its browser is reachable.
#[derive(Debug)]
pub struct Session {
    id: String,
    platform: String,
    browser: BrowserHandle,
    caps: CapsHandle,
    /// Upstream create-session response, forwarded verbatim to the client
    /// (WebDriver only).
    response: Option<serde_json::Value>,
    created: Instant,
    /// Tears down active proxied streams on delete (Playwright only).
    cancel: Option<CancellationToken>,
}

impl Session {
    pub fn new(
        id: String,
        platform: String,
        browser: BrowserHandle,
        caps: CapsHandle,
        response: Option<serde_json::Value>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Session {
            id,
            platform,
            browser,
            caps,
            response,
            created: Instant::now(),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn browser(&self) -> &BrowserHandle {
        &self.browser
    }

    pub fn caps(&self) -> &CapsHandle {
        &self.caps
    }

    pub fn response(&self) -> Option<&serde_json::Value> {
        self.response.as_ref()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }
}

/// Platforms default to `LINUX` and are normalized to upper case.
pub fn normalize_platform(platform: &str) -> String {
    if platform.is_empty() {
        crate::catalog::DEFAULT_PLATFORM.to_string()
    } else {
        platform.to_uppercase()
    }
}
