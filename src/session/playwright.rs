//! Playwright session lifecycle.
//!
//! The browser server speaks WebSocket and assigns no session ids of its
//! own, so the broker mints a UUID, probes the workload at the TCP level and
//! keeps a cancellation token per session to tear down proxied streams on
//! delete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::{allocate_bounded, trash_detached, BrowserAllocator, BrowserHandle};
use crate::capabilities::{Capabilities, CapsHandle, PlaywrightCapabilities};
use crate::catalog::{Protocol, DEFAULT_PLATFORM};
use crate::error::{Error, Result};
use crate::session::{Session, SessionStorage};

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(200);
const CONNECTION_READ_PROBE: Duration = Duration::from_millis(20);

pub struct PlaywrightSessionService {
    allocator: Arc<dyn BrowserAllocator>,
    storage: Arc<SessionStorage>,
    create_timeout: Duration,
    /// In Docker port-mapping mode a forwarded port accepts connections
    /// before anything listens behind it; probe with a short read to tell
    /// the difference.
    check_connection: bool,
}

impl PlaywrightSessionService {
    pub fn new(
        allocator: Arc<dyn BrowserAllocator>,
        storage: Arc<SessionStorage>,
        create_timeout: Duration,
        check_connection: bool,
    ) -> Self {
        PlaywrightSessionService {
            allocator,
            storage,
            create_timeout,
            check_connection,
        }
    }

    /// Allocate and probe a browser server. `cancel` is the request-scoped
    /// token; it stops every wait when the client disconnects while
    /// provisioned workloads are trashed in the background.
    pub async fn create_session(
        &self,
        caps: Arc<PlaywrightCapabilities>,
        cancel: CancellationToken,
    ) -> Result<Arc<Session>> {
        if self.storage.is_shutdown() {
            return Err(Error::StorageShutdown);
        }

        let start = Instant::now();
        let deadline = start + self.create_timeout;

        let browser = allocate_bounded(
            Arc::clone(&self.allocator),
            Protocol::Playwright,
            Arc::clone(&caps) as CapsHandle,
            self.create_timeout,
            cancel.clone(),
        )
        .await
        .map_err(|e| e.wrap_timeout("failed to allocate playwright browser"))?;

        if let Err(err) = self
            .wait_browser_server_started(&browser, deadline, &cancel)
            .await
        {
            trash_detached(browser);
            return Err(
                err.wrap_timeout("browser server did not get ready within configured timeout")
            );
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            DEFAULT_PLATFORM.to_string(),
            Arc::clone(&browser),
            caps.clone() as CapsHandle,
            None,
            Some(CancellationToken::new()),
        ));
        if let Err(err) = self.storage.add(Protocol::Playwright, Arc::clone(&session)) {
            trash_detached(browser);
            return Err(err);
        }

        tracing::info!(
            session_id = %id,
            browser_name = %caps.name(),
            browser_version = %caps.version(),
            url = %browser.url(),
            elapsed = ?start.elapsed(),
            "playwright session is ready"
        );
        Ok(session)
    }

    pub fn find_session(&self, id: &str) -> Result<Arc<Session>> {
        self.storage
            .get(Protocol::Playwright, id)
            .ok_or_else(|| Error::not_found(format!("session {id} doesn't exist")))
    }

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.storage.list(Protocol::Playwright)
    }

    /// Remove the session, cancel its active streams, and hand the browser
    /// back (through the pool when one is configured).
    pub async fn delete_session(&self, session: &Session) {
        if !self.storage.delete(Protocol::Playwright, session.id()) {
            return;
        }
        if let Some(cancel) = session.cancel_token() {
            cancel.cancel();
        }
        session.browser().close(false).await;
        tracing::info!(session_id = %session.id(), "playwright session has been deleted");
    }

    async fn wait_browser_server_started(
        &self,
        browser: &BrowserHandle,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = browser.url();
        let addr = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or(80)
        );

        let mut last_error: Option<String> = None;
        loop {
            match TcpStream::connect(&addr).await {
                Ok(mut conn) => {
                    if !self.check_connection {
                        return Ok(());
                    }
                    let mut buf = [0u8; 1];
                    match tokio::time::timeout(CONNECTION_READ_PROBE, conn.read(&mut buf)).await {
                        // a live listener either sends something, closes, or
                        // just sits on the open connection
                        Err(_) | Ok(Ok(_)) => return Ok(()),
                        Ok(Err(err)) => last_error = Some(err.to_string()),
                    }
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
                    return Err(Error::canceled("canceled while waiting for browser server"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAllocator;
    use tokio::net::TcpListener;

    async fn service_with_listener(check_connection: bool) -> (PlaywrightSessionService, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // keep accepted connections open so the read probe blocks
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((conn, _)) => held.push(conn),
                    Err(_) => break,
                }
            }
        });

        let allocator =
            Arc::new(MockAllocator::new().with_base_url(&format!("http://{addr}")));
        let storage = SessionStorage::new();
        (
            PlaywrightSessionService::new(
                allocator,
                storage,
                Duration::from_secs(2),
                check_connection,
            ),
            addr.to_string(),
        )
    }

    #[tokio::test]
    async fn create_and_delete_session() {
        let (service, _) = service_with_listener(true).await;
        let caps = Arc::new(PlaywrightCapabilities {
            browser: "chromium".to_string(),
            ..Default::default()
        });

        let session = service
            .create_session(caps, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.platform(), "LINUX");
        assert!(session.cancel_token().is_some());
        assert!(service.find_session(session.id()).is_ok());

        let token = session.cancel_token().unwrap().clone();
        service.delete_session(&session).await;
        assert!(token.is_cancelled());
        assert!(service.find_session(session.id()).is_err());

        // double delete performs nothing further
        service.delete_session(&session).await;
        assert_eq!(service.list_sessions().len(), 0);
    }

    #[tokio::test]
    async fn unreachable_browser_times_out_as_gateway_timeout() {
        // allocate against a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let allocator =
            Arc::new(MockAllocator::new().with_base_url(&format!("http://{addr}")));
        let storage = SessionStorage::new();
        let service = PlaywrightSessionService::new(
            Arc::clone(&allocator) as Arc<dyn crate::browser::BrowserAllocator>,
            storage,
            Duration::from_millis(300),
            false,
        );

        let caps = Arc::new(PlaywrightCapabilities {
            browser: "chromium".to_string(),
            ..Default::default()
        });
        let err = service
            .create_session(caps, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GatewayTimeout { .. }));

        // the workload must not leak
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(allocator.created(), allocator.closed());
    }

    #[tokio::test]
    async fn client_cancellation_stops_probe_and_trashes_browser() {
        // a closed port keeps the probe looping until the cancel fires
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let allocator =
            Arc::new(MockAllocator::new().with_base_url(&format!("http://{addr}")));
        let storage = SessionStorage::new();
        let service = PlaywrightSessionService::new(
            Arc::clone(&allocator) as Arc<dyn crate::browser::BrowserAllocator>,
            storage,
            Duration::from_secs(5),
            false,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let caps = Arc::new(PlaywrightCapabilities {
            browser: "chromium".to_string(),
            ..Default::default()
        });
        let err = service.create_session(caps, cancel).await.unwrap_err();
        assert!(matches!(err, Error::Canceled { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(allocator.created(), allocator.closed());
    }

    #[tokio::test]
    async fn storage_shutdown_rejects_create() {
        let (service, _) = service_with_listener(false).await;
        service
            .storage
            .shutdown(Duration::from_secs(1))
            .await
            .unwrap();
        let caps = Arc::new(PlaywrightCapabilities::default());
        assert!(matches!(
            service
                .create_session(caps, CancellationToken::new())
                .await
                .unwrap_err(),
            Error::StorageShutdown
        ));
    }
}
