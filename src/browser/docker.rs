//! Docker backend allocator.
//!
//! Creates one container per browser workload through the Docker Engine API,
//! waits for it to run (and for its port mappings in port-mapping mode),
//! derives the reachable addresses and hands out a [`Browser`] handle whose
//! close force-removes the container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::browser::{Browser, BrowserAllocator, BrowserHandle};
use crate::capabilities::{Capabilities, CapsHandle};
use crate::catalog::{BrowsersCatalog, ContainerPort, ImageConfig, Protocol};
use crate::error::{Error, Result};

const PORT_WAIT_INITIAL: Duration = Duration::from_millis(100);
const PORT_WAIT_FACTOR: u32 = 2;
const PORT_WAIT_STEPS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    /// Network to attach workloads to; auto-detected when unset and port
    /// mapping is off.
    pub network: Option<String>,
    /// Publish workload ports on the daemon host instead of dialing
    /// container IPs directly.
    pub map_ports: bool,
    pub privileged: bool,
    /// Pre-pull all catalog images at startup.
    pub pull_images: bool,
}

pub struct DockerAllocator {
    client: Docker,
    catalog: Arc<BrowsersCatalog>,
    network: Option<String>,
    map_ports: bool,
    privileged: bool,
    /// Daemon host used as the forwarded host in port-mapping mode.
    host: String,
}

impl DockerAllocator {
    pub async fn new(
        client: Docker,
        catalog: Arc<BrowsersCatalog>,
        opts: DockerOptions,
    ) -> Result<Self> {
        if opts.pull_images {
            pull_missing_images(&client, &catalog).await?;
        }

        let mut network = opts.network.clone();
        let mut host = String::new();
        if opts.map_ports {
            host = daemon_host();
            tracing::info!(host = %host, "running in port mapping mode");
        } else if network.is_none() {
            let detected = detect_own_network(&client).await.map_err(|e| {
                Error::internal(format!(
                    "failed to detect own docker network, consider specifying --docker-network: {e}"
                ))
            })?;
            network = Some(detected);
        }

        Ok(DockerAllocator {
            client,
            catalog,
            network,
            map_ports: opts.map_ports,
            privileged: opts.privileged,
            host,
        })
    }

    async fn create_container(
        &self,
        cfg: &ImageConfig,
        caps: &dyn Capabilities,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let tag = cfg.tag(caps.version()).ok_or_else(|| {
            Error::bad_request(format!(
                "image tag is missing for version {}",
                caps.version()
            ))
        })?;
        let image = format!("{}:{}", cfg.image, tag);
        let ports = cfg.ports(caps.vnc_enabled());

        let exposed_ports: HashMap<String, HashMap<(), ()>> = ports
            .values()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let port_bindings = if self.map_ports {
            // dynamic host bindings
            Some(
                ports
                    .values()
                    .map(|port| {
                        (
                            format!("{port}/tcp"),
                            Some(vec![PortBinding {
                                host_ip: Some(String::new()),
                                host_port: Some(String::new()),
                            }]),
                        )
                    })
                    .collect(),
            )
        } else {
            None
        };

        let host_config = HostConfig {
            binds: if cfg.volumes.is_empty() {
                None
            } else {
                Some(cfg.volumes.clone())
            },
            network_mode: self.network.clone(),
            port_bindings,
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            extra_hosts: if caps.hosts().is_empty() {
                None
            } else {
                Some(caps.hosts().to_vec())
            },
            links: if caps.links().is_empty() {
                None
            } else {
                Some(caps.links().to_vec())
            },
            privileged: Some(self.privileged),
            tmpfs: if cfg.tmpfs.is_empty() {
                None
            } else {
                Some(parse_tmpfs(&cfg.tmpfs))
            },
            shm_size: if cfg.shm_size > 0 {
                Some(cfg.shm_size)
            } else {
                None
            },
            memory: parse_memory_limit(&cfg.limits)?,
            nano_cpus: parse_cpu_limit(&cfg.limits)?,
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            env: Some(build_env(&cfg.env, caps)),
            cmd: if cfg.cmd.is_empty() {
                None
            } else {
                Some(cfg.cmd.clone())
            },
            labels: Some(build_labels(&cfg.labels, caps.labels())),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = match self.client.create_container::<String, _>(None, config.clone()).await {
            Ok(created) => created,
            Err(err) if is_not_found(&err) => {
                // Pull on a detached task: an impatient client must not
                // interrupt the pull, only stop waiting for it. The daemon
                // deduplicates concurrent pulls of the same image.
                let (tx, rx) = tokio::sync::oneshot::channel();
                let client = self.client.clone();
                let image_name = image.clone();
                tokio::spawn(async move {
                    let _ = tx.send(pull_image(&client, &image_name).await);
                });
                tokio::select! {
                    res = rx => match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            return Err(Error::internal(format!(
                                "failed to pull image {image}: {err}"
                            )))
                        }
                        Err(_) => {
                            return Err(Error::internal(format!(
                                "pull of image {image} aborted unexpectedly"
                            )))
                        }
                    },
                    _ = cancel.cancelled() => {
                        return Err(Error::canceled(format!(
                            "canceled while pull of image {image} is still in progress"
                        )))
                    }
                }
                self.client
                    .create_container::<String, _>(None, config)
                    .await
                    .map_err(|e| Error::internal(format!("failed to create container: {e}")))?
            }
            Err(err) => {
                return Err(Error::internal(format!("failed to create container: {err}")))
            }
        };

        Ok(created.id)
    }

    async fn start_container(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInspectResponse> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::internal(format!("failed to start container: {e}")))?;

        // Port mappings show up asynchronously on some daemons; poll with
        // backoff and fall through with the last inspect once the schedule
        // is exhausted.
        let mut delay = PORT_WAIT_INITIAL;
        let mut steps = 0usize;
        loop {
            let inspect = self
                .client
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
                .map_err(|e| Error::internal(format!("failed to inspect started container: {e}")))?;

            let ports = inspect
                .network_settings
                .as_ref()
                .and_then(|ns| ns.ports.as_ref());
            if self.map_ports && !all_ports_mapped(ports) && steps < PORT_WAIT_STEPS {
                if steps == 0 {
                    tracing::info!(container = %id, "waiting for port mappings to get ready...");
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::canceled(
                            "canceled while waiting for port mappings",
                        ))
                    }
                }
                delay *= PORT_WAIT_FACTOR;
                steps += 1;
                continue;
            }

            let running = inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            if !running {
                let status = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.status)
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::internal(format!("container state is {status}")));
            }

            tracing::info!(container = %id, "container started");
            return Ok(inspect);
        }
    }

    fn build_browser(
        &self,
        cfg: &ImageConfig,
        vnc_enabled: bool,
        info: ContainerInspectResponse,
    ) -> Result<DockerBrowser> {
        let id = info
            .id
            .clone()
            .ok_or_else(|| Error::internal("container inspect carries no id"))?;
        let settings = info
            .network_settings
            .as_ref()
            .ok_or_else(|| Error::internal("container inspect carries no network settings"))?;

        let container_ip = self.container_ip(settings)?;
        let browser_port = cfg.browser_port();
        let host = format!("{container_ip}:{browser_port}");

        let (forwarded_host, mut ports) = if self.map_ports {
            let mapped = settings.ports.as_ref().cloned().unwrap_or_default();
            let mut resolved = HashMap::new();
            for (name, port) in cfg.ports(vnc_enabled) {
                let mapped_port = mapped_host_port(&mapped, port).ok_or_else(|| {
                    Error::internal(format!(
                        "failed to get container mapped port for {name} port ({port})"
                    ))
                })?;
                resolved.insert(name, mapped_port);
            }
            (self.host.clone(), resolved)
        } else {
            (container_ip, cfg.ports(vnc_enabled).into_iter().collect())
        };

        let primary = ports
            .get(&ContainerPort::Browser)
            .copied()
            .unwrap_or(browser_port);
        let url = Url::parse(&format!("http://{forwarded_host}:{primary}{}", cfg.path))
            .map_err(|e| Error::internal(format!("failed to construct browser URL: {e}")))?;
        ports.remove(&ContainerPort::Browser);

        Ok(DockerBrowser {
            client: self.client.clone(),
            container_id: id,
            url,
            host,
            forwarded_host,
            ports,
        })
    }

    fn container_ip(&self, settings: &bollard::models::NetworkSettings) -> Result<String> {
        if let Some(ip) = settings.ip_address.as_ref().filter(|ip| !ip.is_empty()) {
            return Ok(ip.clone());
        }
        let networks = settings
            .networks
            .as_ref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::internal("container is not connected to configured network"))?;

        let endpoint = match self.network.as_deref() {
            Some(name) => networks.get(name),
            // no network configured: take the first one alphabetically
            None => {
                let mut names: Vec<&String> = networks.keys().collect();
                names.sort();
                names.first().and_then(|name| networks.get(*name))
            }
        }
        .ok_or_else(|| Error::internal("container is not connected to configured network"))?;

        endpoint
            .ip_address
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::internal("couldn't detect container ip address within configured network")
            })
    }

    fn remove_detached(&self, id: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            remove_container(&client, &id).await;
        });
    }
}

#[async_trait]
impl BrowserAllocator for DockerAllocator {
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

        let id = self.create_container(&cfg, caps.as_ref(), &cancel).await?;

        let info = match self.start_container(&id, &cancel).await {
            Ok(info) => info,
            Err(err) => {
                self.remove_detached(id);
                return Err(err);
            }
        };

        match self.build_browser(&cfg, caps.vnc_enabled(), info) {
            Ok(browser) => Ok(Arc::new(browser)),
            Err(err) => {
                self.remove_detached(id);
                Err(err)
            }
        }
    }
}

struct DockerBrowser {
    client: Docker,
    container_id: String,
    url: Url,
    host: String,
    forwarded_host: String,
    ports: HashMap<ContainerPort, u16>,
}

#[async_trait]
impl Browser for DockerBrowser {
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
        remove_container(&self.client, &self.container_id).await;
    }
}

async fn remove_container(client: &Docker, id: &str) {
    let result = client
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
    match result {
        Ok(()) => tracing::info!(container = %id, "container has been removed"),
        Err(err) => tracing::error!(container = %id, error = %err, "failed to remove container"),
    }
}

async fn pull_image(client: &Docker, image: &str) -> Result<()> {
    tracing::info!(image = %image, "pulling image");
    let start = Instant::now();
    let mut stream = client.create_image(
        Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(progress) = stream.next().await {
        progress.map_err(|e| Error::internal(format!("image pull failed: {e}")))?;
    }
    tracing::info!(image = %image, duration = ?start.elapsed(), "image pull completed");
    Ok(())
}

async fn pull_missing_images(client: &Docker, catalog: &BrowsersCatalog) -> Result<()> {
    tracing::info!("pulling images for configured browsers ...");
    for image in catalog.images() {
        match client.inspect_image(&image).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => pull_image(client, &image).await?,
            Err(err) => {
                return Err(Error::internal(format!(
                    "inspect failed for image {image}: {err}"
                )))
            }
        }
    }
    Ok(())
}

/// Find the network this process itself is attached to by matching running
/// containers' endpoint IPs against the local interface addresses.
async fn detect_own_network(client: &Docker) -> Result<String> {
    let local_ips: Vec<String> = if_addrs::get_if_addrs()
        .map_err(|e| Error::internal(format!("failed to collect local ips: {e}")))?
        .into_iter()
        .map(|iface| iface.ip().to_string())
        .collect();

    let containers = client
        .list_containers(Some(ListContainersOptions::<String>::default()))
        .await
        .map_err(|e| Error::internal(format!("failed to list running containers: {e}")))?;

    for container in containers {
        let networks = match container.network_settings.and_then(|ns| ns.networks) {
            Some(networks) if !networks.is_empty() => networks,
            _ => continue,
        };
        for (name, endpoint) in networks {
            if let Some(ip) = endpoint.ip_address.as_ref() {
                if local_ips.iter().any(|local| local == ip) {
                    tracing::info!(network = %name, "detected own docker network");
                    return Ok(name);
                }
            }
        }
    }
    Err(Error::internal(
        "unable to find container with any local assigned ip addresses",
    ))
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Daemon host as seen from this process, used to address mapped ports.
fn daemon_host() -> String {
    if let Ok(docker_host) = std::env::var("DOCKER_HOST") {
        if let Ok(url) = Url::parse(&docker_host) {
            if let Some(host) = url.host_str() {
                if url.scheme() != "unix" && url.scheme() != "npipe" {
                    return host.to_string();
                }
            }
        }
    }
    "127.0.0.1".to_string()
}

/// Catalog env overlaid with capability overrides plus the forced VNC and
/// resolution variables, rendered as sorted `K=V` pairs.
fn build_env(config_env: &HashMap<String, String>, caps: &dyn Capabilities) -> Vec<String> {
    let mut combined = config_env.clone();
    for entry in caps.envs() {
        let mut parts = entry.splitn(2, '=');
        let key = parts.next().unwrap_or_default().to_string();
        let value = parts.next().unwrap_or_default().to_string();
        combined.insert(key, value);
    }
    combined.insert(
        "ENABLE_VNC".to_string(),
        caps.vnc_enabled().to_string(),
    );
    combined.insert(
        "SCREEN_RESOLUTION".to_string(),
        caps.resolution().to_string(),
    );

    let mut entries: Vec<String> = combined
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    entries.sort();
    entries
}

fn build_labels(
    config_labels: &HashMap<String, String>,
    caps_labels: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut labels = config_labels.clone();
    labels.extend(caps_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels
}

fn parse_tmpfs(tmpfs: &[String]) -> HashMap<String, String> {
    tmpfs
        .iter()
        .map(|entry| {
            let mut parts = entry.splitn(2, ':');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn all_ports_mapped(ports: Option<&HashMap<String, Option<Vec<PortBinding>>>>) -> bool {
    let ports = match ports {
        Some(ports) if !ports.is_empty() => ports,
        _ => return false,
    };
    ports.values().all(|bindings| {
        bindings
            .as_ref()
            .and_then(|b| b.first())
            .and_then(|b| b.host_port.as_ref())
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    })
}

fn mapped_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    port: u16,
) -> Option<u16> {
    ports
        .get(&format!("{port}/tcp"))?
        .as_ref()?
        .first()?
        .host_port
        .as_ref()?
        .split('/')
        .next()?
        .parse()
        .ok()
}

/// Parse a cpu quantity (`"1"`, `"1.5"`, `"500m"`) into nano-cpus.
fn parse_cpu_limit(limits: &HashMap<String, String>) -> Result<Option<i64>> {
    let raw = match limits.get("cpu") {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    let nanos = if let Some(milli) = raw.strip_suffix('m') {
        milli
            .parse::<f64>()
            .map_err(|_| Error::internal(format!("invalid cpu limit: {raw}")))?
            * 1e6
    } else {
        raw.parse::<f64>()
            .map_err(|_| Error::internal(format!("invalid cpu limit: {raw}")))?
            * 1e9
    };
    Ok(Some(nanos as i64))
}

/// Parse a memory quantity (`"2Gi"`, `"512Mi"`, `"1G"`, plain bytes).
fn parse_memory_limit(limits: &HashMap<String, String>) -> Result<Option<i64>> {
    let raw = match limits.get("memory") {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    let err = || Error::internal(format!("invalid memory limit: {raw}"));

    const UNITS: [(&str, i64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("", 1),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(number) = raw.strip_suffix(suffix) {
            if suffix.is_empty() && number.is_empty() {
                continue;
            }
            if number.chars().all(|c| c.is_ascii_digit() || c == '.') && !number.is_empty() {
                let value = number.parse::<f64>().map_err(|_| err())?;
                return Ok(Some((value * multiplier as f64) as i64));
            }
        }
    }
    Err(err())
}
