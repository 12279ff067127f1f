//! WebDriver session lifecycle.
//!
//! Create runs the full flow: allocate a workload, poll its `/status`
//! endpoint until the driver answers, replay the caller's capabilities to
//! the upstream `POST /session`, pull the upstream-assigned session id out
//! of the response and store the session. Any failure past allocation
//! trashes the workload on a detached task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::browser::{allocate_bounded, trash_detached, BrowserAllocator, BrowserHandle};
use crate::capabilities::{Capabilities, CapsHandle, WebdriverCapabilities};
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};
use crate::session::{normalize_platform, Session, SessionStorage};

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(200);

pub struct WebdriverSessionService {
    allocator: Arc<dyn BrowserAllocator>,
    storage: Arc<SessionStorage>,
    client: reqwest::Client,
    create_timeout: Duration,
    /// Replay session deletes upstream so a pooled browser comes back clean.
    proxy_delete: bool,
}

impl WebdriverSessionService {
    pub fn new(
        allocator: Arc<dyn BrowserAllocator>,
        storage: Arc<SessionStorage>,
        client: reqwest::Client,
        create_timeout: Duration,
        proxy_delete: bool,
    ) -> Self {
        WebdriverSessionService {
            allocator,
            storage,
            client,
            create_timeout,
            proxy_delete,
        }
    }

    /// Run the full create flow. `cancel` is the request-scoped token: it
    /// fires when the client disconnects and stops every wait in the chain,
    /// while anything already provisioned is trashed in the background.
    pub async fn create_session(
        &self,
        caps: Arc<WebdriverCapabilities>,
        cancel: CancellationToken,
    ) -> Result<Arc<Session>> {
        if self.storage.is_shutdown() {
            return Err(Error::StorageShutdown);
        }

        let platform = normalize_platform(caps.platform());
        let start = Instant::now();
        let deadline = start + self.create_timeout;

        let browser = allocate_bounded(
            Arc::clone(&self.allocator),
            Protocol::Webdriver,
            Arc::clone(&caps) as CapsHandle,
            self.create_timeout,
            cancel.clone(),
        )
        .await
        .map_err(|e| e.wrap_timeout("failed to allocate webdriver"))?;

        if let Err(err) = self.wait_webdriver_started(&browser, deadline, &cancel).await {
            trash_detached(browser);
            return Err(err.wrap_timeout("webdriver did not get ready within configured timeout"));
        }

        let response = match self
            .proxy_create_session(&browser, caps.raw(), deadline, &cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                trash_detached(browser);
                return Err(err.wrap_timeout("failed to proxy create session request"));
            }
        };

        let id = match extract_session_id(&response) {
            Ok(id) => id,
            Err(err) => {
                trash_detached(browser);
                return Err(err);
            }
        };

        let session = Arc::new(Session::new(
            id.clone(),
            platform,
            Arc::clone(&browser),
            caps.clone() as CapsHandle,
            Some(response),
            None,
        ));
        if let Err(err) = self.storage.add(Protocol::Webdriver, Arc::clone(&session)) {
            trash_detached(browser);
            return Err(err);
        }

        tracing::info!(
            session_id = %id,
            browser_name = %caps.name(),
            browser_version = %caps.version(),
            url = %browser.url(),
            elapsed = ?start.elapsed(),
            "webdriver session is ready"
        );
        Ok(session)
    }

    pub fn find_session(&self, id: &str) -> Result<Arc<Session>> {
        self.storage
            .get(Protocol::Webdriver, id)
            .ok_or_else(|| Error::not_found(format!("session {id} doesn't exist")))
    }

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.storage.list(Protocol::Webdriver)
    }

    /// Remove the session and release its workload. A second call for the
    /// same session is a no-op and performs no upstream requests.
    pub async fn delete_session(&self, session: &Session) {
        if !self.storage.delete(Protocol::Webdriver, session.id()) {
            return;
        }

        let mut trash = true;
        if self.proxy_delete {
            trash = !self.upstream_delete(session).await;
        }
        if !trash {
            if let Err(err) = self.cleanup_downloads(session).await {
                tracing::warn!(error = %err, "failed to clean up webdriver session files");
                trash = true;
            }
        }

        session.browser().close(trash).await;
        tracing::info!(session_id = %session.id(), "webdriver session has been deleted");
    }

    async fn wait_webdriver_started(
        &self,
        browser: &BrowserHandle,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut status_url = browser.url().clone();
        let path = format!("{}/status", status_url.path().trim_end_matches('/'));
        status_url.set_path(&path);

        let mut last_error: Option<String> = None;
        loop {
            let result = self
                .client
                .get(status_url.clone())
                .header(reqwest::header::HOST, browser.host())
                .send()
                .await;
            match result {
                // redirects during driver bootstrap count as alive, hence
                // anything below 400 passes
                Ok(resp) if resp.status().as_u16() < 400 => return Ok(()),
                Ok(resp) => {
                    last_error = Some(format!(
                        "request {status_url} failed with code {}",
                        resp.status().as_u16()
                    ));
                }
                Err(err) => last_error = Some(err.to_string()),
            }

            if Instant::now() + READY_PROBE_INTERVAL >= deadline {
                let detail = last_error.unwrap_or_else(|| "no probe completed".to_string());
                return Err(Error::gateway_timeout(format!(
                    "deadline exceeded, last error was: {detail}"
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(READY_PROBE_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::canceled("canceled while waiting for webdriver"))
                }
            }
        }
    }

    async fn proxy_create_session(
        &self,
        browser: &BrowserHandle,
        raw_caps: &[u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut url = browser.url().clone();
        let path = format!("{}/session", url.path().trim_end_matches('/'));
        url.set_path(&path);

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::gateway_timeout("deadline exceeded"));
        }

        let request = self
            .client
            .post(url.clone())
            .header(reqwest::header::HOST, browser.host())
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .body(raw_caps.to_vec())
            .timeout(remaining);
        let resp = tokio::select! {
            res = request.send() => res.map_err(|e| {
                if e.is_timeout() {
                    Error::gateway_timeout(e.to_string())
                } else {
                    Error::internal(e.to_string())
                }
            })?,
            _ = cancel.cancelled() => {
                return Err(Error::canceled("canceled while proxying create session request"))
            }
        };

        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "create request failed on {url} with HTTP code {}: {body}",
                status.as_u16()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::internal(format!("failed to decode create session response: {e}")))
    }

    async fn upstream_delete(&self, session: &Session) -> bool {
        let browser = session.browser();
        let mut url = browser.url().clone();
        let path = format!(
            "{}/session/{}",
            url.path().trim_end_matches('/'),
            session.id()
        );
        url.set_path(&path);

        match self
            .client
            .delete(url.clone())
            .header(reqwest::header::HOST, browser.host())
            .send()
            .await
        {
            Ok(resp) if resp.status().as_u16() == 200 => true,
            Ok(resp) => {
                tracing::error!(
                    url = %url,
                    status = resp.status().as_u16(),
                    "unexpected HTTP response code when closing webdriver session"
                );
                false
            }
            Err(err) => {
                tracing::error!(url = %url, error = %err, "failed to close webdriver session");
                false
            }
        }
    }

    /// Delete leftovers from the workload's fileserver so a pooled browser
    /// starts the next session clean.
    async fn cleanup_downloads(&self, session: &Session) -> Result<()> {
        let host_port = match session.browser().host_port(ContainerPort::Fileserver) {
            Some(host_port) => host_port,
            None => return Ok(()),
        };
        let base = format!("http://{host_port}");

        let files: Vec<String> = self
            .client
            .get(format!("{base}/?json=true"))
            .send()
            .await
            .map_err(|e| Error::internal(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::internal(format!("failed to list session files: {e}")))?;

        for file in &files {
            let resp = self
                .client
                .delete(format!("{base}/{file}"))
                .send()
                .await
                .map_err(|e| Error::internal(e.to_string()))?;
            let status = resp.status().as_u16();
            if !(200..300).contains(&status) && status != 404 {
                return Err(Error::internal(format!(
                    "delete of {file} failed with code {status}"
                )));
            }
        }

        if !files.is_empty() {
            tracing::info!(
                session_id = %session.id(),
                count = files.len(),
                "webdriver session cleanup: files have been deleted"
            );
        }
        Ok(())
    }
}

/// Pull the session id out of an upstream create response. Both shapes are
/// accepted: top-level `sessionId` and the W3C `value.sessionId` nesting.
fn extract_session_id(response: &serde_json::Value) -> Result<String> {
    if let Some(id) = response.get("sessionId") {
        return id
            .as_str()
            .map(String::from)
            .ok_or_else(|| Error::internal("failed to cast sessionId to string"));
    }
    let value = response
        .get("value")
        .ok_or_else(|| Error::internal("wrong create session response structure"))?;
    let id = value
        .get("sessionId")
        .ok_or_else(|| Error::internal("wrong create session response structure"))?;
    id.as_str()
        .map(String::from)
        .ok_or_else(|| Error::internal("failed to cast sessionId to string"))
}
