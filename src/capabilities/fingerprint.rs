//! Capability fingerprinting.
//!
//! Two requests with the same fingerprint are mutually substitutable
//! workloads, which is what keys the idle pools. The fingerprint covers every
//! capability field that affects the provisioned container and nothing else.

use sha2::{Digest, Sha256};

use crate::capabilities::Capabilities;
use crate::catalog::Protocol;

/// 128-bit fingerprint over the workload-defining capability fields.
pub fn fingerprint(caps: &dyn Capabilities) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(caps.platform().as_bytes());
    hasher.update(caps.name().as_bytes());
    hasher.update(caps.flavor().as_bytes());
    hasher.update(caps.version().as_bytes());
    hasher.update(caps.resolution().as_bytes());
    hasher.update(joined_sorted(caps.envs()).as_bytes());
    hasher.update(if caps.vnc_enabled() { b"true" as &[u8] } else { b"false" });
    hasher.update(joined_labels(caps).as_bytes());
    hasher.update(joined_sorted(caps.links()).as_bytes());
    hasher.update(joined_sorted(caps.hosts()).as_bytes());
    hasher.update(joined_sorted(caps.networks()).as_bytes());

    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Pool key: `<protocol>-<browser name>-<hex(fingerprint)>`.
pub fn pool_key(protocol: Protocol, caps: &dyn Capabilities) -> String {
    format!(
        "{}-{}-{}",
        protocol,
        caps.name(),
        hex::encode(fingerprint(caps))
    )
}

fn joined_sorted(values: &[String]) -> String {
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted.join(";")
}

fn joined_labels(caps: &dyn Capabilities) -> String {
    let mut entries: Vec<String> = caps
        .labels()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    entries.sort();
    entries.join(";")
}
