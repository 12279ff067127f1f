//! Capabilities-to-pod conversion.
//!
//! The pod manifest is a handlebars template rendered against the resolved
//! image config, the request options and an operator-supplied values
//! document, then deserialized into a typed pod. The lineage label is
//! injected after rendering; everything else is up to the template.

use std::collections::HashMap;

use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};

use crate::capabilities::Capabilities;
use crate::catalog::ImageConfig;
use crate::error::{Error, Result};

/// Label tying every pod to the broker process that created it; the pod
/// watcher scopes its watch to this label.
pub const LINEAGE_LABEL: &str = "gridrunner/lineage";

/// CI metadata surfaced to templates (useful for cost attribution labels).
#[derive(Debug, Clone, Default)]
pub struct CiEnvironment {
    pub job_id: String,
    pub project_namespace: String,
    pub project_name: String,
}

impl CiEnvironment {
    pub fn from_env() -> Self {
        CiEnvironment {
            job_id: std::env::var("CI_JOB_ID").unwrap_or_default(),
            project_namespace: std::env::var("CI_PROJECT_NAMESPACE").unwrap_or_default(),
            project_name: std::env::var("CI_PROJECT_NAME").unwrap_or_default(),
        }
    }
}

pub struct PodConverter {
    registry: Handlebars<'static>,
    values: Value,
    ci: CiEnvironment,
    lineage: String,
}

impl PodConverter {
    pub fn new(template: &str, values_yaml: &str, lineage: &str, ci: CiEnvironment) -> Result<Self> {
        let values: Value = if values_yaml.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_yaml::from_str(values_yaml)
                .map_err(|e| Error::internal(format!("failed to parse template values: {e}")))?
        };

        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_helper("toYaml", Box::new(to_yaml_helper));
        registry
            .register_template_string("pod", template)
            .map_err(|e| Error::internal(format!("failed to parse pod template: {e}")))?;

        Ok(PodConverter {
            registry,
            values,
            ci,
            lineage: lineage.to_string(),
        })
    }

    pub fn to_pod(&self, cfg: &ImageConfig, caps: &dyn Capabilities) -> Result<Pod> {
        let context = self.template_context(cfg, caps)?;
        let rendered = self
            .registry
            .render("pod", &context)
            .map_err(|e| Error::internal(format!("failed to render pod template: {e}")))?;

        let mut pod: Pod = serde_yaml::from_str(&rendered).map_err(|e| {
            tracing::debug!(manifest = %rendered, "rendered manifest rejected");
            Error::internal(format!("failed to deserialize rendered manifest into pod: {e}"))
        })?;

        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LINEAGE_LABEL.to_string(), self.lineage.clone());
        Ok(pod)
    }

    fn template_context(&self, cfg: &ImageConfig, caps: &dyn Capabilities) -> Result<Value> {
        let tag = cfg.tag(caps.version()).ok_or_else(|| {
            Error::bad_request(format!(
                "image tag is missing for version {}",
                caps.version()
            ))
        })?;

        let ports: HashMap<String, u16> = cfg
            .ports(caps.vnc_enabled())
            .into_iter()
            .map(|(name, port)| (name.to_string(), port))
            .collect();

        let mut env = parse_env(caps.envs());
        env.insert("ENABLE_VNC".to_string(), caps.vnc_enabled().to_string());
        env.insert("SCREEN_RESOLUTION".to_string(), caps.resolution().to_string());

        Ok(json!({
            "browser": {
                "image": format!("{}:{}", cfg.image, tag),
                "cmd": cfg.cmd,
                "ports": ports,
                "path": cfg.path,
                "env": cfg.env,
                "limits": cfg.limits,
            },
            "options": {
                "env": env,
                "vnc_enabled": caps.vnc_enabled(),
                "resolution": caps.resolution(),
                "labels": caps.labels(),
                "hosts": group_hosts(caps.hosts()),
            },
            "values": self.values,
            "ci": {
                "job_id": self.ci.job_id,
                "project_namespace": self.ci.project_namespace,
                "project_name": self.ci.project_name,
            },
        }))
    }
}

fn to_yaml_helper(
    helper: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = helper
        .param(0)
        .map(|p| p.value().clone())
        .unwrap_or(Value::Null);
    let yaml = serde_yaml::to_string(&value)
        .map_err(|e| RenderErrorReason::Other(format!("toYaml failed: {e}")))?;
    out.write(yaml.trim_end_matches('\n'))?;
    Ok(())
}

fn parse_env(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .map(|entry| {
            let mut parts = entry.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Group `hostname:ip` entries into ip -> hostnames, the shape pod
/// `hostAliases` blocks want.
fn group_hosts(hosts: &[String]) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for entry in hosts {
        let mut parts = entry.splitn(2, ':');
        let hostname = parts.next().unwrap_or_default();
        if let Some(ip) = parts.next() {
            grouped
                .entry(ip.to_string())
                .or_default()
                .push(hostname.to_string());
        }
    }
    grouped
}
