//! Playwright HTTP surface.
//!
//! `GET /pw/:name[/:version]` creates a session and proxies the caller's
//! WebSocket straight onto the browser server with a rebuilt query string;
//! the session lives exactly as long as the proxied stream. `/pw/vnc/:sess`
//! tunnels the workload's VNC port.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{validate_resolution, Capabilities, PlaywrightCapabilities};
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, Result};
use crate::event::{released_event, requested_event};
use crate::server::proxy::{forward, render_error, ErrorStyle};
use crate::server::{tunnel, AppState};
use crate::session::Session;

/// Browser-server launch options; serialized back into the upstream query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(
        rename = "firefoxUserPrefs",
        default,
        skip_serializing_if = "serde_json::Map::is_empty"
    )]
    pub firefox_user_prefs: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PwOptions {
    pub name: String,
    pub version: String,
    pub flavor: String,
    pub launch: LaunchOptions,
    pub vnc_enabled: bool,
    pub resolution: String,
    pub env: Vec<String>,
    pub links: Vec<String>,
    pub hosts: Vec<String>,
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl PwOptions {
    pub fn to_capabilities(&self) -> PlaywrightCapabilities {
        PlaywrightCapabilities {
            browser: self.name.clone(),
            version: self.version.clone(),
            platform: String::new(),
            flavor: self.flavor.clone(),
            vnc_enabled: self.vnc_enabled,
            resolution: self.resolution.clone(),
            env: self.env.clone(),
            links: self.links.clone(),
            hosts: self.hosts.clone(),
            networks: self.networks.clone(),
            labels: self.labels.clone(),
        }
    }
}

pub async fn create_session(
    state: State<Arc<AppState>>,
    Path(name): Path<String>,
    query: RawQuery,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    create_common(state, name, String::new(), query, ws, req).await
}

pub async fn create_session_versioned(
    state: State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
    query: RawQuery,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    create_common(state, name, version, query, ws, req).await
}

async fn create_common(
    State(state): State<Arc<AppState>>,
    name: String,
    version: String,
    RawQuery(query): RawQuery,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let opts = match parse_pw_options(&name, &version, query.as_deref().unwrap_or("")) {
        Ok(opts) => opts,
        Err(err) => {
            state.broker.publish(requested_event(
                Protocol::Playwright,
                &name,
                &version,
                None,
                Some(err.to_string()),
            ));
            return render_error(ErrorStyle::Plain, "", &err);
        }
    };

    let caps = Arc::new(opts.to_capabilities());
    let start = std::time::Instant::now();

    // the guard cancels the token when this handler future is dropped (the
    // client went away); the create task keeps running, observes the token
    // and publishes the outcome either way
    let cancel = CancellationToken::new();
    let _disconnect_guard = cancel.clone().drop_guard();

    let service = Arc::clone(&state.pw);
    let broker = Arc::clone(&state.broker);
    let task_caps = Arc::clone(&caps);
    let task_name = opts.name.clone();
    let task_version = opts.version.clone();
    let result = tokio::spawn(async move {
        let result = service.create_session(task_caps, cancel).await;
        match &result {
            Ok(_) => broker.publish(requested_event(
                Protocol::Playwright,
                &task_name,
                &task_version,
                Some(start.elapsed()),
                None,
            )),
            Err(err) => {
                tracing::error!(error = %err, "failed to create playwright session");
                broker.publish(requested_event(
                    Protocol::Playwright,
                    &task_name,
                    &task_version,
                    None,
                    Some(err.to_string()),
                ));
            }
        }
        result
    })
    .await;

    let session = match result {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => return render_error(ErrorStyle::Plain, "", &err),
        Err(join_err) => {
            let err = Error::internal(format!("panic: {join_err}"));
            tracing::error!(error = %err, "create playwright session panicked");
            state.broker.publish(requested_event(
                Protocol::Playwright,
                &opts.name,
                &opts.version,
                None,
                Some(err.to_string()),
            ));
            return render_error(ErrorStyle::Plain, "", &err);
        }
    };

    let upstream_query = upstream_query(&opts.launch);
    let browser = session.browser();
    let mut upstream = browser.url().clone();
    upstream.set_query(Some(&upstream_query));

    match ws {
        Some(ws) => {
            let mut ws_url = upstream.clone();
            let _ = ws_url.set_scheme("ws");
            let cancel = session.cancel_token().cloned();
            let tunnel_state = Arc::clone(&state);
            let tunnel_session = Arc::clone(&session);
            ws.on_upgrade(move |socket| async move {
                tunnel::ws_to_ws(socket, ws_url.to_string(), cancel).await;
                finish_session(&tunnel_state, &tunnel_session).await;
            })
        }
        None => {
            let host = browser.host().to_string();
            let (parts, _) = req.into_parts();
            let response = forward(
                &state.client,
                parts.method,
                upstream,
                &host,
                &parts.headers,
                axum::body::Bytes::new(),
                ErrorStyle::Plain,
            )
            .await;
            finish_session(&state, &session).await;
            response
        }
    }
}

async fn finish_session(state: &AppState, session: &Session) {
    state.broker.publish(released_event(
        Protocol::Playwright,
        session.caps().name(),
        session.caps().version(),
        session.created().elapsed(),
    ));
    state.pw.delete_session(session).await;
}

/// `ANY /pw/vnc/:sess` - byte tunnel onto the workload's VNC port, torn
/// down when the session is deleted.
pub async fn vnc(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let session = match state.pw.find_session(&session_id) {
        Ok(session) => session,
        Err(err) => return render_error(ErrorStyle::Plain, "", &err),
    };
    let addr = match session.browser().host_port(ContainerPort::Vnc) {
        Some(addr) => addr,
        None => {
            return render_error(
                ErrorStyle::Plain,
                "",
                &Error::service_unavailable("port vnc is not supported or not enabled"),
            )
        }
    };
    let cancel = session.cancel_token().cloned();
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| tunnel::ws_to_tcp(socket, addr, cancel)),
        None => (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response(),
    }
}

/// Query string replayed to the browser server: launch args first, then the
/// headless toggle, then the full launch options as JSON.
fn upstream_query(launch: &LaunchOptions) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for arg in &launch.args {
        query.append_pair("arg", arg);
    }
    if let Some(headless) = launch.headless {
        query.append_pair("headless", if headless { "true" } else { "false" });
    }
    let launch_json = serde_json::to_string(launch).unwrap_or_default();
    query.append_pair("launch-options", &launch_json);
    query.finish()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(Error::bad_request(format!("invalid boolean: {other}"))),
    }
}

fn valid_env_key(key: &str) -> bool {
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub fn parse_pw_options(name: &str, version: &str, query: &str) -> Result<PwOptions> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let first = |key: &str| -> Option<&str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let all = |key: &str| -> Vec<String> {
        pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    };

    let mut opts = PwOptions {
        name: name.to_string(),
        version: version.to_string(),
        flavor: first("flavor").unwrap_or_default().to_string(),
        ..Default::default()
    };

    if let Some(launch_json) = first("launch-options") {
        if !launch_json.is_empty() {
            opts.launch = serde_json::from_str(launch_json)
                .map_err(|e| Error::bad_request(format!("malformed launch-options parameter: {e}")))?;
            validate_launch_options(&opts.launch)?;
        }
    }

    opts.launch.args.extend(all("arg"));

    if let Some(channel) = first("channel") {
        if !channel.is_empty() {
            opts.launch.channel = channel.to_string();
        }
    }

    if let Some(vnc) = first("vnc") {
        let enabled =
            parse_bool(vnc).map_err(|e| Error::bad_request(format!("bad vnc parameter: {e}")))?;
        opts.vnc_enabled = enabled;
        opts.launch.headless = Some(!enabled);
    }

    if let Some(headless) = first("headless") {
        let headless = parse_bool(headless)
            .map_err(|e| Error::bad_request(format!("bad headless parameter: {e}")))?;
        opts.launch.headless = Some(headless);
        opts.vnc_enabled = !headless;
    }

    if let Some(resolution) = first("resolution") {
        if !resolution.is_empty() {
            validate_resolution(resolution)?;
            opts.resolution = resolution.to_string();
        }
    }

    let env = all("env");
    if !env.is_empty() {
        for entry in &env {
            let mut parts = entry.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            if parts.next().is_none() {
                return Err(Error::bad_request(format!(
                    "malformed env param (key=value expected): {entry}"
                )));
            }
            if !valid_env_key(key) {
                return Err(Error::bad_request(format!("invalid env name: {key}")));
            }
        }
        opts.env = env;
    }

    opts.links = all("link");
    opts.hosts = all("host");
    opts.networks = all("network");

    for label in all("label") {
        let mut parts = label.splitn(2, '=');
        let key = parts.next().unwrap_or_default().to_string();
        match parts.next() {
            Some(value) => {
                opts.labels.insert(key, value.to_string());
            }
            None => {
                return Err(Error::bad_request(format!(
                    "malformed label format '{label}' (expected key=value)"
                )))
            }
        }
    }

    for pref in all("firefoxUserPref") {
        let mut parts = pref.splitn(2, '=');
        let key = parts.next().unwrap_or_default().to_string();
        let raw = parts.next().ok_or_else(|| {
            Error::bad_request(format!(
                "malformed firefoxUserPref param (key=value expected): {pref}"
            ))
        })?;
        // no type information in a query string, so guess: int, bool, else
        // string; explicit launch-options cover the rest
        let value = if let Ok(int) = raw.parse::<i64>() {
            Value::from(int)
        } else {
            match raw {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                other => Value::String(other.to_string()),
            }
        };
        opts.launch.firefox_user_prefs.insert(key, value);
    }

    Ok(opts)
}

fn validate_launch_options(launch: &LaunchOptions) -> Result<()> {
    for (key, value) in &launch.firefox_user_prefs {
        if matches!(value, Value::Object(_) | Value::Array(_) | Value::Null) {
            return Err(Error::bad_request(format!(
                "invalid firefoxUserPref {key} value, only primitive non null types allowed"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_option_args_merge_before_query_args() {
        let opts = parse_pw_options(
            "test",
            "",
            "headless=false&resolution=1x2x3&arg=a&arg=b&launch-options=%7B%22args%22%3A%5B%22c%22%5D%7D",
        )
        .unwrap();
        assert_eq!(opts.launch.args, ["c", "a", "b"]);
        assert_eq!(opts.launch.headless, Some(false));
        assert!(opts.vnc_enabled);
        assert_eq!(opts.resolution, "1x2x3");

        let query = upstream_query(&opts.launch);
        assert!(query.starts_with("arg=c&arg=a&arg=b&headless=false&launch-options="));
        // the serialized options embed the merged arg list
        let encoded = query.rsplit("launch-options=").next().unwrap();
        let decoded: LaunchOptions = serde_json::from_str(
            &url::form_urlencoded::parse(format!("x={encoded}").as_bytes())
                .next()
                .unwrap()
                .1,
        )
        .unwrap();
        assert_eq!(decoded.args, ["c", "a", "b"]);
        assert_eq!(decoded.headless, Some(false));
    }

    #[test]
    fn vnc_and_headless_are_inverse() {
        let opts = parse_pw_options("test", "", "vnc=true").unwrap();
        assert!(opts.vnc_enabled);
        assert_eq!(opts.launch.headless, Some(false));

        // a later headless param wins
        let opts = parse_pw_options("test", "", "vnc=true&headless=true").unwrap();
        assert!(!opts.vnc_enabled);
        assert_eq!(opts.launch.headless, Some(true));

        assert!(parse_pw_options("test", "", "vnc=sometimes").is_err());
    }

    #[test]
    fn env_entries_are_validated() {
        let opts = parse_pw_options("test", "", "env=PW_DEBUG=1&env=MOZ_LOG=all").unwrap();
        assert_eq!(opts.env.len(), 2);
        assert!(parse_pw_options("test", "", "env=NOVALUE").is_err());
        assert!(parse_pw_options("test", "", "env=BAD%20KEY=1").is_err());
    }

    #[test]
    fn labels_parse_as_pairs() {
        let opts = parse_pw_options("test", "", "label=team=qa&label=run=7").unwrap();
        assert_eq!(opts.labels.get("team").unwrap(), "qa");
        assert_eq!(opts.labels.get("run").unwrap(), "7");
        assert!(parse_pw_options("test", "", "label=plain").is_err());
    }

    #[test]
    fn firefox_prefs_guess_types() {
        let opts = parse_pw_options(
            "test",
            "",
            "firefoxUserPref=a=1&firefoxUserPref=b=true&firefoxUserPref=c=false&firefoxUserPref=d=str",
        )
        .unwrap();
        let prefs = &opts.launch.firefox_user_prefs;
        assert_eq!(prefs.get("a").unwrap(), &Value::from(1));
        assert_eq!(prefs.get("b").unwrap(), &Value::Bool(true));
        assert_eq!(prefs.get("c").unwrap(), &Value::Bool(false));
        assert_eq!(prefs.get("d").unwrap(), &Value::String("str".to_string()));
        assert!(parse_pw_options("test", "", "firefoxUserPref=novalue").is_err());
    }

    #[test]
    fn launch_options_reject_non_primitive_prefs() {
        // firefoxUserPrefs with an object value
        let query = format!(
            "launch-options={}",
            url::form_urlencoded::byte_serialize(
                br#"{"firefoxUserPrefs":{"bad":{"nested":1}}}"#
            )
            .collect::<String>()
        );
        assert!(parse_pw_options("test", "", &query).is_err());

        let query = format!(
            "launch-options={}",
            url::form_urlencoded::byte_serialize(br#"{"firefoxUserPrefs":{"bad":null}}"#)
                .collect::<String>()
        );
        assert!(parse_pw_options("test", "", &query).is_err());

        assert!(parse_pw_options("test", "", "launch-options=notjson").is_err());
    }

    #[test]
    fn channel_overrides_launch_options() {
        let opts = parse_pw_options("test", "", "channel=chrome-beta").unwrap();
        assert_eq!(opts.launch.channel, "chrome-beta");
    }
}
