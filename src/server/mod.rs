//! HTTP surface: route table, shared state and the proxy/tunnel layers.

pub mod handlers;
pub mod playwright;
pub mod proxy;
pub mod tunnel;
pub mod webdriver;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::routing::{any, delete, get, post};
use axum::Router;
use serde::Serialize;

use crate::browser::quota::QuotaAuthorizer;
use crate::capabilities::ProxyOptions;
use crate::catalog::BrowsersCatalog;
use crate::event::EventBroker;
use crate::session::{PlaywrightSessionService, WebdriverSessionService};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub git_ref: String,
    pub git_sha: String,
}

impl AppInfo {
    pub fn from_build() -> Self {
        AppInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            git_ref: option_env!("GIT_REF").unwrap_or_default().to_string(),
            git_sha: option_env!("GIT_SHA").unwrap_or_default().to_string(),
        }
    }
}

pub struct AppState {
    pub wd: Arc<WebdriverSessionService>,
    pub pw: Arc<PlaywrightSessionService>,
    pub catalog: Arc<BrowsersCatalog>,
    pub quota: Option<Arc<QuotaAuthorizer>>,
    pub broker: Arc<EventBroker>,
    pub client: reqwest::Client,
    /// Raw config files served on `/config`, keyed by file name.
    pub config_files: BTreeMap<String, String>,
    pub info: AppInfo,
    /// Proxy injected into WebDriver capabilities lacking a manual one.
    pub default_proxy: Option<ProxyOptions>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/browsers", get(handlers::browsers))
        .route("/status", get(handlers::status))
        .route("/quota", get(handlers::quota))
        .route("/info", get(handlers::info))
        .route("/config", get(handlers::config_index))
        .route("/config/:name", get(handlers::config_file))
        .route("/vnc/:sess", get(webdriver::vnc))
        .route("/download/:sess", any(webdriver::download))
        .route("/download/:sess/*rest", any(webdriver::download_path))
        .route("/clipboard/:sess", any(webdriver::clipboard))
        .route("/devtools/:sess", any(webdriver::devtools))
        .route("/devtools/:sess/*rest", any(webdriver::devtools_path))
        .route("/wd/hub/status", get(handlers::wd_status))
        .route("/wd/hub/session", post(webdriver::create_session))
        .route("/wd/hub/session/:sess", delete(webdriver::delete_session))
        .route("/wd/hub/session/:sess/*rest", any(webdriver::proxy_session))
        .route("/pw/vnc/:sess", any(playwright::vnc))
        .route("/pw/:name", get(playwright::create_session))
        .route("/pw/:name/:version", get(playwright::create_session_versioned))
        .with_state(state)
}
