//! Command line configuration.
//!
//! Every flag can also come from the environment with a `GR_` prefix, which
//! is how the container images are configured in practice.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::capabilities::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Auto,
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PortMapping {
    Auto,
    Enabled,
    Disabled,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(name = "gridrunner", about = "Browser session broker", version)]
pub struct Cli {
    /// Address to serve the API on.
    #[arg(long, env = "GR_LISTEN", default_value = "0.0.0.0:4444")]
    pub listen: String,

    /// Workload backend; auto picks kubernetes inside a cluster.
    #[arg(long, env = "GR_BACKEND", value_enum, default_value_t = Backend::Auto)]
    pub backend: Backend,

    /// Browsers catalog file.
    #[arg(long, env = "GR_BROWSERS_CONFIG", default_value = "config/browsers.yaml")]
    pub browsers_config: PathBuf,

    /// Namespace to create pods in.
    #[arg(long, env = "GR_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Pod manifest template.
    #[arg(long, env = "GR_KUBE_TEMPLATE", default_value = "config/pod.yaml.hbs")]
    pub kube_template: PathBuf,

    /// Values document available to the pod template; optional.
    #[arg(long, env = "GR_KUBE_TEMPLATE_VALUES", default_value = "config/values.yaml")]
    pub kube_template_values: PathBuf,

    /// Overall budget for one session create (allocation + readiness +
    /// upstream create).
    #[arg(long, env = "GR_CREATE_TIMEOUT", value_parser = duration_arg, default_value = "2m")]
    pub create_timeout: Duration,

    /// Retries for transient pod create failures.
    #[arg(long, env = "GR_CREATE_RETRIES", default_value_t = 3)]
    pub create_retries: usize,

    /// Upstream HTTP connect timeout.
    #[arg(long, env = "GR_CONNECT_TIMEOUT", value_parser = duration_arg, default_value = "10s")]
    pub connect_timeout: Duration,

    /// Idle browsers kept per pool; 0 disables pooling.
    #[arg(long, env = "GR_POOL_MAX_IDLE", default_value_t = 0)]
    pub pool_max_idle: usize,

    /// Total lifetime of a pooled browser.
    #[arg(long, env = "GR_POOL_MAX_AGE", value_parser = duration_arg, default_value = "1h")]
    pub pool_max_age: Duration,

    /// How long a browser may sit idle before eviction.
    #[arg(long, env = "GR_POOL_IDLE_TIMEOUT", value_parser = duration_arg, default_value = "10m")]
    pub pool_idle_timeout: Duration,

    /// Docker network to attach workloads to; auto-detected when omitted.
    #[arg(long, env = "GR_DOCKER_NETWORK")]
    pub docker_network: Option<String>,

    /// Run workload containers privileged.
    #[arg(long, env = "GR_DOCKER_PRIVILEGED")]
    pub docker_privileged: bool,

    /// Pull all catalog images at startup.
    #[arg(long, env = "GR_DOCKER_PULL_IMAGES")]
    pub docker_pull_images: bool,

    /// Publish workload ports on the daemon host instead of dialing
    /// container IPs.
    #[arg(long, env = "GR_DOCKER_PORT_MAPPING", value_enum, default_value_t = PortMapping::Auto)]
    pub docker_port_mapping: PortMapping,

    /// Global concurrent session limit; 0 disables the quota.
    #[arg(long, env = "GR_QUOTA_LIMIT", default_value_t = 0)]
    pub quota_limit: usize,

    /// Requests allowed to queue for a quota slot.
    #[arg(long, env = "GR_QUEUE_SIZE", default_value_t = 0)]
    pub queue_size: usize,

    /// How long a request may wait in the quota queue.
    #[arg(long, env = "GR_QUEUE_TIMEOUT", value_parser = duration_arg, default_value = "1m")]
    pub queue_timeout: Duration,

    /// Deadline for graceful shutdown.
    #[arg(long, env = "GR_SHUTDOWN_TIMEOUT", value_parser = duration_arg, default_value = "30s")]
    pub shutdown_timeout: Duration,

    /// Outbound proxy injected into WebDriver capabilities that carry no
    /// manual proxy of their own.
    #[arg(long, env = "GR_PROXY_HOST")]
    pub proxy_host: Option<String>,

    /// No-proxy list accompanying the injected proxy.
    #[arg(long, env = "GR_NO_PROXY")]
    pub no_proxy: Option<String>,
}

impl Cli {
    /// Resolve the auto backend: kubernetes inside a cluster, docker
    /// elsewhere.
    pub fn resolved_backend(&self) -> Backend {
        match self.backend {
            Backend::Auto => {
                if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
                    Backend::Kubernetes
                } else {
                    Backend::Docker
                }
            }
            other => other,
        }
    }

    /// Resolve auto port mapping: on when the daemon is remote (tcp
    /// `DOCKER_HOST`) or on a Docker Desktop style host, off for a local
    /// daemon sharing networks with this process.
    pub fn resolved_port_mapping(&self) -> bool {
        match self.docker_port_mapping {
            PortMapping::Enabled => true,
            PortMapping::Disabled => false,
            PortMapping::Auto => {
                if cfg!(target_os = "macos") || cfg!(target_os = "windows") {
                    return true;
                }
                std::env::var("DOCKER_HOST")
                    .map(|host| host.starts_with("tcp://") || host.starts_with("http"))
                    .unwrap_or(false)
            }
        }
    }
}
