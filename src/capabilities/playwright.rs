//! Playwright capability record.
//!
//! Playwright sessions carry no upstream create payload; everything is
//! derived from the request path and query string by the HTTP layer, which
//! hands the assembled record here.

use std::collections::HashMap;
use std::time::Duration;

use crate::capabilities::Capabilities;

#[derive(Debug, Clone, Default)]
pub struct PlaywrightCapabilities {
    pub browser: String,
    pub version: String,
    pub platform: String,
    pub flavor: String,
    pub vnc_enabled: bool,
    pub resolution: String,
    pub env: Vec<String>,
    pub links: Vec<String>,
    pub hosts: Vec<String>,
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl Capabilities for PlaywrightCapabilities {
    fn name(&self) -> &str {
        &self.browser
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn resolution(&self) -> &str {
        &self.resolution
    }

    fn vnc_enabled(&self) -> bool {
        self.vnc_enabled
    }

    fn test_name(&self) -> &str {
        ""
    }

    fn envs(&self) -> &[String] {
        &self.env
    }

    fn session_timeout(&self) -> Duration {
        Duration::ZERO
    }

    fn raw(&self) -> &[u8] {
        &[]
    }

    fn flavor(&self) -> &str {
        &self.flavor
    }

    fn links(&self) -> &[String] {
        &self.links
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn networks(&self) -> &[String] {
        &self.networks
    }

    fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }
}
