//! Informational endpoints: catalog listing, session status, quota usage,
//! build info and the loaded config files.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::catalog::Protocol;
use crate::server::AppState;

#[derive(Serialize)]
struct StatusBody {
    total: usize,
    sessions: HashMap<String, Vec<SessionStatus>>,
}

#[derive(Serialize)]
struct SessionStatus {
    id: String,
    url: String,
}

pub async fn browsers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let protocol_param = params.get("protocol").map(String::as_str).unwrap_or("");
    let protocol = if protocol_param.is_empty() {
        Some(Protocol::Webdriver)
    } else {
        Protocol::parse(protocol_param)
    };
    let flavor = params.get("flavor").map(String::as_str).unwrap_or("");

    let listing = protocol.and_then(|p| state.catalog.browsers(p, flavor));
    match listing {
        Some(listing) => Json(listing).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("no browsers configured for protocol {protocol_param}"),
        )
            .into_response(),
    }
}

/// Active WebDriver sessions aggregated by platform.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.wd.list_sessions();
    let mut body = StatusBody {
        total: sessions.len(),
        sessions: HashMap::new(),
    };
    for session in sessions {
        body.sessions
            .entry(session.platform().to_string())
            .or_default()
            .push(SessionStatus {
                id: session.id().to_string(),
                url: session.browser().url().to_string(),
            });
    }
    Json(serde_json::to_value(body).unwrap_or_else(|_| json!({})))
}

pub async fn quota(State(state): State<Arc<AppState>>) -> Response {
    match &state.quota {
        Some(quota) => Json(json!({
            "limit": quota.limit(),
            "allocated": quota.allocated(),
        }))
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "quota information is not available",
        )
            .into_response(),
    }
}

pub async fn info(State(state): State<Arc<AppState>>) -> Json<crate::server::AppInfo> {
    Json(state.info.clone())
}

pub async fn config_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let files: HashMap<&String, serde_json::Value> = state
        .config_files
        .iter()
        .map(|(name, content)| {
            let digest = Sha256::digest(content.as_bytes());
            (name, json!({ "sha256Sum": hex::encode(digest) }))
        })
        .collect();
    Json(json!({ "files": files }))
}

pub async fn config_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.config_files.get(&name) {
        Some(content) => content.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn wd_status() -> Json<serde_json::Value> {
    Json(json!({ "value": { "ready": true } }))
}
