//! WebDriver capability decoding.
//!
//! Accepts both the legacy JSONWire shape (`{"desiredCapabilities": {...}}`)
//! and the W3C shape (`{"capabilities": {"alwaysMatch": ..., "firstMatch":
//! [...]}}`). W3C trees are deep-merged first: `alwaysMatch` seeds the result,
//! then each `firstMatch` entry adds keys that are still absent, recursing
//! into nested maps.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::capabilities::{
    parse_duration, validate_resolution, Capabilities, ProxyOptions, PROXY_TYPE_MANUAL,
};
use crate::error::{Error, Result};

/// Vendor extension block carrying broker-specific options.
const VENDOR_OPTIONS_KEY: &str = "selenoid:options";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    JsonWire,
    W3c,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct VendorOptions {
    name: String,
    #[serde(rename = "sessionTimeout")]
    session_timeout: String,
    #[serde(rename = "screenResolution")]
    screen_resolution: String,
    #[serde(rename = "enableVNC")]
    enable_vnc: bool,
    env: Vec<String>,
    flavor: String,
    #[serde(rename = "applicationContainers")]
    links: Vec<String>,
    #[serde(rename = "hostsEntries")]
    hosts: Vec<String>,
    #[serde(rename = "additionalNetworks")]
    networks: Vec<String>,
    labels: HashMap<String, String>,
}

/// Parsed WebDriver capabilities plus the raw request bytes forwarded
/// upstream on session create.
#[derive(Debug, Clone)]
pub struct WebdriverCapabilities {
    name: String,
    device_name: String,
    version: String,
    platform: String,
    proxy: Option<ProxyOptions>,
    options: VendorOptions,
    session_timeout: Duration,
    raw: Vec<u8>,
}

impl WebdriverCapabilities {
    /// Decode a capabilities payload. When `default_proxy` is set and the
    /// caller did not configure a manual proxy, the proxy is injected into
    /// the capability tree and the raw bytes are re-serialized so upstream
    /// sees the injected value; otherwise the bytes are preserved verbatim.
    pub fn parse(raw: &[u8], default_proxy: Option<&ProxyOptions>) -> Result<Self> {
        let mut root: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::bad_request(format!("failed parsing capabilities json: {e}")))?;

        let (merged, dialect) = match root.get("capabilities") {
            Some(w3c) => (merge_w3c(w3c)?, Dialect::W3c),
            None => match root.get("desiredCapabilities").and_then(Value::as_object) {
                Some(desired) => (desired.clone(), Dialect::JsonWire),
                None => {
                    return Err(Error::bad_request(
                        "no valid capabilities provided in request",
                    ))
                }
            },
        };

        let mut caps = decode(&merged, dialect)?;

        let manual = caps
            .proxy
            .as_ref()
            .map(|p| p.proxy_type == PROXY_TYPE_MANUAL)
            .unwrap_or(false);
        if let (Some(proxy), false) = (default_proxy, manual) {
            inject_proxy(&mut root, dialect, proxy)?;
            caps.proxy = Some(proxy.clone());
            caps.raw = serde_json::to_vec(&root).map_err(|e| {
                Error::internal(format!("failed to serialize updated capabilities: {e}"))
            })?;
        } else {
            caps.raw = raw.to_vec();
        }

        validate_resolution(&caps.options.screen_resolution)?;
        Ok(caps)
    }

    pub fn proxy(&self) -> Option<&ProxyOptions> {
        self.proxy.as_ref()
    }
}

impl Capabilities for WebdriverCapabilities {
    fn name(&self) -> &str {
        if self.device_name.is_empty() {
            &self.name
        } else {
            &self.device_name
        }
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn resolution(&self) -> &str {
        &self.options.screen_resolution
    }

    fn vnc_enabled(&self) -> bool {
        self.options.enable_vnc
    }

    fn test_name(&self) -> &str {
        &self.options.name
    }

    fn envs(&self) -> &[String] {
        &self.options.env
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn flavor(&self) -> &str {
        &self.options.flavor
    }

    fn links(&self) -> &[String] {
        &self.options.links
    }

    fn hosts(&self) -> &[String] {
        &self.options.hosts
    }

    fn networks(&self) -> &[String] {
        &self.options.networks
    }

    fn labels(&self) -> &HashMap<String, String> {
        &self.options.labels
    }
}

fn merge_w3c(caps: &Value) -> Result<Map<String, Value>> {
    let mut merged = Map::new();
    if let Some(always) = caps.get("alwaysMatch").and_then(Value::as_object) {
        deep_merge(&mut merged, always);
    }
    if let Some(first) = caps.get("firstMatch").and_then(Value::as_array) {
        for entry in first {
            let entry = entry
                .as_object()
                .ok_or_else(|| Error::bad_request("firstMatch entries must be objects"))?;
            deep_merge(&mut merged, entry);
        }
    }
    Ok(merged)
}

/// Add keys from `src` that are absent in `dst`; recurse when both sides hold
/// maps. First writer wins at the leaf level.
fn deep_merge(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dst.get_mut(key), value.as_object()) {
            (Some(Value::Object(existing)), Some(incoming)) => {
                deep_merge(existing, incoming);
            }
            (Some(_), _) => {}
            (None, _) => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

fn decode(merged: &Map<String, Value>, dialect: Dialect) -> Result<WebdriverCapabilities> {
    let (version_key, platform_key) = match dialect {
        Dialect::W3c => ("browserVersion", "platformName"),
        Dialect::JsonWire => ("version", "platform"),
    };

    let proxy = match merged.get("proxy") {
        Some(value) => Some(
            serde_json::from_value::<ProxyOptions>(value.clone())
                .map_err(|e| Error::bad_request(format!("invalid proxy capability: {e}")))?,
        ),
        None => None,
    };

    let options = match merged.get(VENDOR_OPTIONS_KEY) {
        Some(value) => serde_json::from_value::<VendorOptions>(value.clone())
            .map_err(|e| Error::bad_request(format!("invalid {VENDOR_OPTIONS_KEY}: {e}")))?,
        None => VendorOptions::default(),
    };

    let session_timeout = if options.session_timeout.is_empty() {
        Duration::ZERO
    } else {
        parse_duration(&options.session_timeout)?
    };

    Ok(WebdriverCapabilities {
        name: get_string(merged, "browserName")?,
        device_name: get_string(merged, "deviceName")?,
        version: get_string(merged, version_key)?,
        platform: get_string(merged, platform_key)?,
        proxy,
        options,
        session_timeout,
        raw: Vec::new(),
    })
}

fn get_string(map: &Map<String, Value>, key: &str) -> Result<String> {
    match map.get(key) {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Error::bad_request(format!(
            "capability {key} must be a string"
        ))),
    }
}

fn inject_proxy(root: &mut Value, dialect: Dialect, proxy: &ProxyOptions) -> Result<()> {
    let proxy_value = serde_json::to_value(proxy)
        .map_err(|e| Error::internal(format!("failed to encode proxy options: {e}")))?;
    let target = match dialect {
        Dialect::W3c => root
            .get_mut("capabilities")
            .and_then(Value::as_object_mut)
            .map(|caps| {
                caps.entry("alwaysMatch")
                    .or_insert_with(|| Value::Object(Map::new()))
            })
            .and_then(Value::as_object_mut),
        Dialect::JsonWire => root
            .get_mut("desiredCapabilities")
            .and_then(Value::as_object_mut),
    };
    match target {
        Some(map) => {
            map.insert("proxy".to_string(), proxy_value);
            Ok(())
        }
        None => Err(Error::bad_request("malformed capabilities tree")),
    }
}
