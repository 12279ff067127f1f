//! Browsers catalog: resolves (protocol, name, flavor, version) to a concrete
//! container image definition.
//!
//! The catalog is loaded once at startup from a YAML document shaped as
//! `protocol -> browser name -> images -> flavor -> image config`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_FLAVOR: &str = "default";
pub const DEFAULT_PLATFORM: &str = "LINUX";

/// Front-door protocol a workload is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Webdriver,
    Playwright,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Webdriver => "webdriver",
            Protocol::Playwright => "playwright",
        }
    }

    pub fn parse(s: &str) -> Option<Protocol> {
        match s {
            "webdriver" => Some(Protocol::Webdriver),
            "playwright" => Some(Protocol::Playwright),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ports a workload may expose. The enumeration is closed: `Browser` is the
/// primary protocol port, the rest are side channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPort {
    Browser,
    Vnc,
    Devtools,
    Fileserver,
    Clipboard,
}

impl ContainerPort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerPort::Browser => "browser",
            ContainerPort::Vnc => "vnc",
            ContainerPort::Devtools => "devtools",
            ContainerPort::Fileserver => "fileserver",
            ContainerPort::Clipboard => "clipboard",
        }
    }
}

impl std::fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image flavor for a browser.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub default_version: String,
    pub version_tags: HashMap<String, String>,
    pub ports: BTreeMap<ContainerPort, u16>,
    pub path: String,
    pub env: HashMap<String, String>,
    pub limits: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub shm_size: i64,
    pub tmpfs: Vec<String>,
    pub volumes: Vec<String>,
}

impl ImageConfig {
    /// Tag for the requested version, falling back to the default version
    /// when the request left it empty.
    pub fn tag(&self, version: &str) -> Option<&str> {
        let version = if version.is_empty() {
            &self.default_version
        } else {
            version
        };
        self.version_tags.get(version).map(String::as_str)
    }

    /// Ports to expose; the vnc port is omitted unless VNC was requested.
    pub fn ports(&self, vnc_enabled: bool) -> BTreeMap<ContainerPort, u16> {
        self.ports
            .iter()
            .filter(|(name, _)| vnc_enabled || **name != ContainerPort::Vnc)
            .map(|(name, port)| (*name, *port))
            .collect()
    }

    pub fn browser_port(&self) -> u16 {
        self.ports
            .get(&ContainerPort::Browser)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BrowserEntry {
    #[serde(default)]
    images: HashMap<String, ImageConfig>,
}

/// Catalog entry summary as exposed on `GET /browsers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserInfo {
    pub name: String,
    pub default_version: String,
    pub default_platform: String,
    pub versions: Vec<BrowserVersion>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserVersion {
    pub number: String,
    pub platform: String,
}

/// Parsed browsers catalog.
#[derive(Debug, Clone, Default)]
pub struct BrowsersCatalog {
    catalog: HashMap<Protocol, HashMap<String, BrowserEntry>>,
}

impl BrowsersCatalog {
    pub fn from_yaml(data: &str) -> Result<Self> {
        let catalog: HashMap<Protocol, HashMap<String, BrowserEntry>> =
            serde_yaml::from_str(data)
                .map_err(|e| Error::internal(format!("failed to parse browsers catalog: {e}")))?;
        Ok(BrowsersCatalog { catalog })
    }

    /// Resolve an image config; `flavor` defaults to `"default"` when empty.
    pub fn lookup_image(
        &self,
        protocol: Protocol,
        name: &str,
        flavor: &str,
    ) -> Option<&ImageConfig> {
        let flavor = if flavor.is_empty() {
            DEFAULT_FLAVOR
        } else {
            flavor
        };
        self.catalog
            .get(&protocol)?
            .get(name)?
            .images
            .get(flavor)
    }

    /// All distinct image references (`image:tag`) across the catalog, sorted.
    pub fn images(&self) -> Vec<String> {
        let mut result: Vec<String> = self
            .catalog
            .values()
            .flat_map(|browsers| browsers.values())
            .flat_map(|entry| entry.images.values())
            .flat_map(|cfg| {
                cfg.version_tags
                    .values()
                    .map(|tag| format!("{}:{}", cfg.image, tag))
            })
            .collect();
        result.sort();
        result.dedup();
        result
    }

    /// Browsers available for a protocol and flavor; `None` when the protocol
    /// has no entries at all.
    pub fn browsers(&self, protocol: Protocol, flavor: &str) -> Option<Vec<BrowserInfo>> {
        let browsers = self.catalog.get(&protocol)?;
        let flavor = if flavor.is_empty() {
            DEFAULT_FLAVOR
        } else {
            flavor
        };

        let mut result: Vec<BrowserInfo> = browsers
            .iter()
            .filter_map(|(name, entry)| {
                let cfg = entry.images.get(flavor)?;
                let mut versions: Vec<BrowserVersion> = cfg
                    .version_tags
                    .keys()
                    .map(|number| BrowserVersion {
                        number: number.clone(),
                        platform: DEFAULT_PLATFORM.to_string(),
                    })
                    .collect();
                versions.sort_by(|a, b| a.number.cmp(&b.number));
                Some(BrowserInfo {
                    name: name.clone(),
                    default_version: cfg.default_version.clone(),
                    default_platform: DEFAULT_PLATFORM.to_string(),
                    versions,
                })
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Some(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
webdriver:
  chrome:
    images:
      default:
        image: registry.example.com/chrome
        defaultVersion: "102.0"
        versionTags:
          "102.0": "102.0-sel"
          "101.0": "101.0-sel"
        ports:
          browser: 4444
          vnc: 5900
          devtools: 7070
          fileserver: 8080
          clipboard: 9090
        path: /wd/hub
        env:
          TZ: UTC
        limits:
          cpu: "1"
          memory: 2Gi
        shmSize: 268435456
        tmpfs: ["/tmp:size=512m"]
  firefox:
    images:
      default:
        image: registry.example.com/firefox
        defaultVersion: "99.0"
        versionTags:
          "99.0": "99.0-sel"
        ports:
          browser: 4444
playwright:
  chromium:
    images:
      default:
        image: registry.example.com/pw-chromium
        defaultVersion: "1.44"
        versionTags:
          "1.44": "1.44-jammy"
        ports:
          browser: 4444
          vnc: 5900
"#;

    #[test]
    fn lookup_image_resolves_default_flavor() {
        let cat = BrowsersCatalog::from_yaml(SAMPLE).unwrap();
        let cfg = cat.lookup_image(Protocol::Webdriver, "chrome", "").unwrap();
        assert_eq!(cfg.image, "registry.example.com/chrome");
        assert_eq!(cfg.tag(""), Some("102.0-sel"));
        assert_eq!(cfg.tag("101.0"), Some("101.0-sel"));
        assert_eq!(cfg.tag("105.0"), None);
        assert!(cat.lookup_image(Protocol::Webdriver, "chrome", "cp").is_none());
        assert!(cat.lookup_image(Protocol::Webdriver, "edge", "").is_none());
    }

    #[test]
    fn ports_omit_vnc_unless_enabled() {
        let cat = BrowsersCatalog::from_yaml(SAMPLE).unwrap();
        let cfg = cat.lookup_image(Protocol::Webdriver, "chrome", "").unwrap();
        let ports = cfg.ports(false);
        assert!(!ports.contains_key(&ContainerPort::Vnc));
        assert_eq!(ports.len(), 4);
        let ports = cfg.ports(true);
        assert_eq!(ports.get(&ContainerPort::Vnc), Some(&5900));
    }

    #[test]
    fn images_are_sorted_and_distinct() {
        let cat = BrowsersCatalog::from_yaml(SAMPLE).unwrap();
        let images = cat.images();
        assert_eq!(images.len(), 4);
        let mut sorted = images.clone();
        sorted.sort();
        assert_eq!(images, sorted);
    }

    #[test]
    fn browsers_listing() {
        let cat = BrowsersCatalog::from_yaml(SAMPLE).unwrap();
        let list = cat.browsers(Protocol::Webdriver, "").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "chrome");
        assert_eq!(list[0].default_platform, "LINUX");
        assert_eq!(list[0].versions.len(), 2);
        assert!(cat.browsers(Protocol::Playwright, "cp").unwrap().is_empty());
    }
}
