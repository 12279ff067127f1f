//! Kubernetes backend allocator.
//!
//! Renders one pod per browser workload from the operator's template,
//! creates it (retrying transient API failures), waits on the shared
//! [`PodWatcher`] for readiness and addresses the workload by pod IP.

pub mod converter;
pub mod watcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::browser::{Browser, BrowserAllocator, BrowserHandle};
use crate::capabilities::{Capabilities, CapsHandle};
use crate::catalog::{BrowsersCatalog, ContainerPort, ImageConfig, Protocol};
use crate::error::{Error, Result};

pub use converter::{CiEnvironment, PodConverter, LINEAGE_LABEL};
pub use watcher::PodWatcher;

/// Jittered exponential backoff schedule for pod create retries.
#[derive(Debug, Clone, Copy)]
pub struct CreateRetry {
    pub steps: usize,
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
}

impl CreateRetry {
    pub fn new(steps: usize, cap: Duration) -> Self {
        CreateRetry {
            steps,
            base: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.3,
            cap,
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let jittered = raw * (1.0 + self.jitter * rand::thread_rng().gen::<f64>());
        Duration::from_secs_f64(jittered).min(self.cap)
    }
}

pub struct KubernetesAllocator {
    api: Api<Pod>,
    catalog: Arc<BrowsersCatalog>,
    converter: PodConverter,
    watcher: Arc<PodWatcher>,
    retry: CreateRetry,
    ready_timeout: Duration,
}

impl KubernetesAllocator {
    pub fn new(
        api: Api<Pod>,
        catalog: Arc<BrowsersCatalog>,
        converter: PodConverter,
        watcher: Arc<PodWatcher>,
        retry: CreateRetry,
        ready_timeout: Duration,
    ) -> Self {
        KubernetesAllocator {
            api,
            catalog,
            converter,
            watcher,
            retry,
            ready_timeout,
        }
    }

    async fn create_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<Pod> {
        let mut attempt = 0usize;
        loop {
            match self.api.create(&PostParams::default(), pod).await {
                Ok(created) => return Ok(created),
                Err(err) if is_retryable(&err) && attempt < self.retry.steps => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %err,
                        ?delay,
                        remaining = self.retry.steps - attempt,
                        "pod create failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(Error::canceled("canceled while retrying pod create"))
                        }
                    }
                }
                Err(err) => {
                    return Err(Error::internal(format!("failed to create pod: {err}")))
                }
            }
        }
    }

    fn delete_detached(&self, name: String) {
        let api = self.api.clone();
        tokio::spawn(async move {
            delete_pod(&api, &name).await;
        });
    }
}

#[async_trait]
impl BrowserAllocator for KubernetesAllocator {
    async fn allocate(
        &self,
        protocol: Protocol,
        caps: CapsHandle,
        cancel: CancellationToken,
    ) -> Result<BrowserHandle> {
        let cfg = self
            .catalog
            .lookup_image(protocol, caps.name(), caps.flavor())
            .ok_or_else(|| {
                Error::bad_request(format!(
                    "browser {} image flavor {} is not supported",
                    caps.name(),
                    caps.flavor()
                ))
            })?
            .clone();

        let pod = self.converter.to_pod(&cfg, caps.as_ref())?;
        let created = self.create_pod(&pod, &cancel).await?;
        let name = created
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("created pod carries no name"))?;
        tracing::info!(pod = %name, "pod has been created");

        let ip = match self
            .watcher
            .wait_pod_ready(&name, self.ready_timeout, &cancel)
            .await
        {
            Ok(ip) => ip,
            Err(err) => {
                self.delete_detached(name);
                return Err(err);
            }
        };

        match build_browser(self.api.clone(), &name, &ip, &cfg, caps.vnc_enabled()) {
            Ok(browser) => Ok(Arc::new(browser)),
            Err(err) => {
                self.delete_detached(name);
                Err(err)
            }
        }
    }
}

fn build_browser(
    api: Api<Pod>,
    name: &str,
    ip: &str,
    cfg: &ImageConfig,
    vnc_enabled: bool,
) -> Result<KubernetesBrowser> {
    let browser_port = cfg.browser_port();
    let host = format!("{ip}:{browser_port}");
    let url = Url::parse(&format!("http://{host}{}", cfg.path))
        .map_err(|e| Error::internal(format!("failed to construct browser URL: {e}")))?;

    let mut ports: HashMap<ContainerPort, u16> = cfg.ports(vnc_enabled).into_iter().collect();
    ports.remove(&ContainerPort::Browser);

    Ok(KubernetesBrowser {
        api,
        pod_name: name.to_string(),
        url,
        host,
        forwarded_host: ip.to_string(),
        ports,
    })
}

struct KubernetesBrowser {
    api: Api<Pod>,
    pod_name: String,
    url: Url,
    host: String,
    forwarded_host: String,
    ports: HashMap<ContainerPort, u16>,
}

#[async_trait]
impl Browser for KubernetesBrowser {
    fn url(&self) -> &Url {
        &self.url
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn host_port(&self, port: ContainerPort) -> Option<String> {
        self.ports
            .get(&port)
            .map(|p| format!("{}:{}", self.forwarded_host, p))
    }

    async fn close(&self, _trash: bool) {
        delete_pod(&self.api, &self.pod_name).await;
    }
}

async fn delete_pod(api: &Api<Pod>, name: &str) {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => tracing::info!(pod = %name, "pod has been deleted"),
        Err(err) => tracing::error!(pod = %name, error = %err, "pod delete failed"),
    }
}

/// Transient API failures worth retrying on pod create.
fn is_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => matches!(
            response.reason.as_str(),
            "Conflict" | "TooManyRequests" | "InternalError" | "ServerTimeout" | "Timeout"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(reason: &str, code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn retryable_error_classes() {
        assert!(is_retryable(&api_error("Conflict", 409)));
        assert!(is_retryable(&api_error("TooManyRequests", 429)));
        assert!(is_retryable(&api_error("InternalError", 500)));
        assert!(is_retryable(&api_error("ServerTimeout", 500)));
        assert!(is_retryable(&api_error("Timeout", 504)));
        assert!(!is_retryable(&api_error("Forbidden", 403)));
        assert!(!is_retryable(&api_error("Invalid", 422)));
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = CreateRetry::new(5, Duration::from_millis(500));
        let first = retry.delay(0);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(130));
        // jitter never shrinks below the exponential base
        assert!(retry.delay(2) >= Duration::from_millis(400));
        assert_eq!(retry.delay(10), Duration::from_millis(500));
    }
}
