//! Capability handling for both front-door dialects.
//!
//! Incoming requests are decoded once at the boundary into a semantic record;
//! everything downstream (pools, allocators, fingerprinting) sees only the
//! [`Capabilities`] view plus the raw bytes needed for upstream forwarding.

mod fingerprint;
mod playwright;
mod webdriver;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use fingerprint::{fingerprint, pool_key};
pub use playwright::PlaywrightCapabilities;
pub use webdriver::WebdriverCapabilities;

/// Semantic view over a session-creation request.
pub trait Capabilities: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn platform(&self) -> &str;
    /// Screen resolution as `WxHxBPP`, or empty when unset.
    fn resolution(&self) -> &str;
    fn vnc_enabled(&self) -> bool;
    fn test_name(&self) -> &str;
    /// Environment overrides as `K=V` strings.
    fn envs(&self) -> &[String];
    fn session_timeout(&self) -> Duration;
    /// Original request bytes, preserved verbatim for upstream forwarding
    /// (empty for dialects with no upstream create payload).
    fn raw(&self) -> &[u8];
    fn flavor(&self) -> &str;
    fn links(&self) -> &[String];
    fn hosts(&self) -> &[String];
    fn networks(&self) -> &[String];
    fn labels(&self) -> &HashMap<String, String>;
}

pub type CapsHandle = Arc<dyn Capabilities>;

impl std::fmt::Debug for dyn Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Capabilities").field("name", &self.name()).finish()
    }
}

pub const PROXY_TYPE_MANUAL: &str = "manual";

/// WebDriver proxy capability (the subset the broker cares about).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(rename = "proxyType", default, skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(rename = "httpProxy", default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,
    #[serde(rename = "sslProxy", default, skip_serializing_if = "String::is_empty")]
    pub ssl_proxy: String,
    #[serde(rename = "noProxy", default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,
}

impl ProxyOptions {
    /// Manual proxy pointing both plain and TLS traffic at `proxy_host`.
    pub fn http_proxy(proxy_host: &str, no_proxy: &str) -> Self {
        ProxyOptions {
            proxy_type: PROXY_TYPE_MANUAL.to_string(),
            http_proxy: proxy_host.to_string(),
            ssl_proxy: proxy_host.to_string(),
            no_proxy: no_proxy.to_string(),
        }
    }
}

/// Validate a `WxHxBPP` resolution string; empty is allowed.
pub fn validate_resolution(resolution: &str) -> Result<()> {
    if resolution.is_empty() {
        return Ok(());
    }
    let parts: Vec<&str> = resolution.split('x').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if valid {
        Ok(())
    } else {
        Err(Error::bad_request(
            "incorrect resolution value format (expected WIDTHxHEIGHTxBPP)",
        ))
    }
}

/// Parse a Go-style duration literal (`"1h30m"`, `"300ms"`, `"45s"`).
///
/// Session timeouts arrive in this format from WebDriver vendor capabilities.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let err = || Error::bad_request(format!("invalid duration: {s}"));
    if s.is_empty() {
        return Err(err());
    }
    let mut total = Duration::ZERO;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let value: f64 = s[start..i].parse().map_err(|_| err())?;
        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let nanos = match &s[unit_start..i] {
            "ns" => value,
            "us" | "µs" => value * 1e3,
            "ms" => value * 1e6,
            "s" => value * 1e9,
            "m" => value * 60e9,
            "h" => value * 3600e9,
            _ => return Err(err()),
        };
        total += Duration::from_nanos(nanos as u64);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_validation() {
        assert!(validate_resolution("").is_ok());
        assert!(validate_resolution("1920x1080x24").is_ok());
        assert!(validate_resolution("1x2x3").is_ok());
        assert!(validate_resolution("1920x1080").is_err());
        assert!(validate_resolution("1920x1080x").is_err());
        assert!(validate_resolution("ax1080x24").is_err());
        assert!(validate_resolution("1920 x 1080 x 24").is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("5").is_err());
    }

    #[test]
    fn proxy_options_serialization_skips_empty() {
        let proxy = ProxyOptions::http_proxy("proxy.local:3128", "");
        let json = serde_json::to_value(&proxy).unwrap();
        assert_eq!(json["proxyType"], "manual");
        assert_eq!(json["httpProxy"], "proxy.local:3128");
        assert!(json.get("noProxy").is_none());
    }
}
