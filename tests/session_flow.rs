//! End-to-end flows over the real router with a mock backend allocator and a
//! stub upstream standing in for the workload.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use gridrunner::browser::quota::QuotaAuthorizer;
use gridrunner::catalog::BrowsersCatalog;
use gridrunner::event::EventBroker;
use gridrunner::server::{router, AppInfo, AppState};
use gridrunner::session::{PlaywrightSessionService, SessionStorage, WebdriverSessionService};
use gridrunner::testing::MockAllocator;

const CATALOG: &str = r#"
webdriver:
  chrome:
    images:
      default:
        image: registry.example.com/chrome
        defaultVersion: "102.0"
        versionTags:
          "102.0": "102.0"
        ports:
          browser: 4444
"#;

/// Records every request the fake workload receives.
#[derive(Default)]
struct UpstreamLog {
    requests: Mutex<Vec<String>>,
}

impl UpstreamLog {
    fn push(&self, entry: String) {
        self.requests.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.entries().iter().filter(|e| e.contains(needle)).count()
    }
}

async fn spawn_upstream() -> (SocketAddr, Arc<UpstreamLog>) {
    let log = Arc::new(UpstreamLog::default());

    async fn status() -> &'static str {
        "{}"
    }

    async fn create(
        State(log): State<Arc<UpstreamLog>>,
        Path(n): Path<String>,
    ) -> Json<Value> {
        log.push(format!("POST /{n}/session"));
        Json(json!({ "value": { "sessionId": "123" } }))
    }

    async fn catchall(
        State(log): State<Arc<UpstreamLog>>,
        method: axum::http::Method,
        uri: axum::http::Uri,
    ) -> impl IntoResponse {
        log.push(format!("{method} {uri}"));
        Json(json!({ "value": null }))
    }

    async fn pw_root(
        State(log): State<Arc<UpstreamLog>>,
        Path(n): Path<String>,
        RawQuery(query): RawQuery,
    ) -> &'static str {
        log.push(format!("GET /{n}?{}", query.unwrap_or_default()));
        "ok"
    }

    let app = Router::new()
        .route("/:n/status", get(status))
        .route("/:n/session", post(create))
        .route("/:n", get(pw_root))
        .fallback(catchall)
        .with_state(Arc::clone(&log));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

struct Harness {
    addr: SocketAddr,
    upstream: Arc<UpstreamLog>,
    allocator: Arc<MockAllocator>,
    storage: Arc<SessionStorage>,
    state: Arc<AppState>,
    client: reqwest::Client,
}

async fn spawn_broker(allocator_delay: Option<Duration>, create_timeout: Duration) -> Harness {
    let (upstream_addr, upstream) = spawn_upstream().await;

    let mut allocator = MockAllocator::new().with_base_url(&format!("http://{upstream_addr}"));
    if let Some(delay) = allocator_delay {
        allocator = allocator.with_delay(delay);
    }
    let allocator = Arc::new(allocator);

    let storage = SessionStorage::new();
    let client = reqwest::Client::new();
    let wd = Arc::new(WebdriverSessionService::new(
        Arc::clone(&allocator) as _,
        Arc::clone(&storage),
        client.clone(),
        create_timeout,
        true,
    ));
    let pw = Arc::new(PlaywrightSessionService::new(
        Arc::clone(&allocator) as _,
        Arc::clone(&storage),
        create_timeout,
        false,
    ));

    let state = Arc::new(AppState {
        wd,
        pw,
        catalog: Arc::new(BrowsersCatalog::from_yaml(CATALOG).unwrap()),
        quota: Some(Arc::new(QuotaAuthorizer::new(4, 2))),
        broker: Arc::new(EventBroker::default()),
        client: client.clone(),
        config_files: BTreeMap::from([(
            "browsers.yaml".to_string(),
            CATALOG.to_string(),
        )]),
        info: AppInfo {
            name: "gridrunner".to_string(),
            git_ref: "refs/heads/main".to_string(),
            git_sha: "deadbeef".to_string(),
        },
        default_proxy: None,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        addr,
        upstream,
        allocator,
        storage,
        state,
        client,
    }
}

const W3C_CREATE_BODY: &str = r#"{"capabilities":{"alwaysMatch":{"browserName":"chrome","browserVersion":"102.0","selenoid:options":{}},"firstMatch":[{}]}}"#;

#[tokio::test]
async fn webdriver_create_session_round_trip() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .header("Content-Type", "application/json")
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "value": { "sessionId": "123" } }));

    assert_eq!(h.allocator.created(), 1);
    assert!(h
        .storage
        .get(gridrunner::catalog::Protocol::Webdriver, "123")
        .is_some());
    assert_eq!(h.upstream.count_matching("POST /0/session"), 1);
}

#[tokio::test]
async fn webdriver_create_timeout_maps_to_gateway_timeout() {
    let h = spawn_broker(Some(Duration::from_secs(5)), Duration::from_millis(100)).await;

    let resp = h
        .client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"]["error"], "session not created");

    // the allocation finishes in the background and the workload is trashed
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.allocator.created(), 1);
    assert_eq!(h.allocator.closed(), 1);
}

#[tokio::test]
async fn malformed_capabilities_return_bad_session_parameters() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"]["error"], "bad session parameters");
    assert_eq!(h.allocator.created(), 0);
}

#[tokio::test]
async fn webdriver_delete_session_is_idempotent() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let session = h
        .state
        .wd
        .find_session("123")
        .expect("session must be stored");

    h.state.wd.delete_session(&session).await;
    let upstream_deletes = h.upstream.count_matching("DELETE /0/session/123");
    assert_eq!(upstream_deletes, 1);

    // second delete: no-op, no further upstream traffic
    h.state.wd.delete_session(&session).await;
    assert_eq!(h.upstream.count_matching("DELETE /0/session/123"), 1);
    assert!(h.state.wd.find_session("123").is_err());
}

#[tokio::test]
async fn deleted_session_is_unknown_to_the_proxy() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .get(format!("http://{}/wd/hub/session/nope/url", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"]["error"], "unknown session");
}

#[tokio::test]
async fn webdriver_proxy_rewrites_and_forwards() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    h.client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();

    let resp = h
        .client
        .get(format!(
            "http://{}/wd/hub/session/123/url?flag=1",
            h.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(h.upstream.count_matching("GET /0/session/123/url?flag=1"), 1);

    // the /se/file suffix is rewritten before forwarding
    h.client
        .post(format!(
            "http://{}/wd/hub/session/123/se/file",
            h.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(h.upstream.count_matching("POST /0/session/123/file"), 1);
    assert_eq!(h.upstream.count_matching("se/file"), 0);
}

#[tokio::test]
async fn playwright_create_replays_launch_options_query() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .get(format!(
            "http://{}/pw/test?headless=false&resolution=1x2x3&arg=a&arg=b&launch-options=%7B%22args%22%3A%5B%22c%22%5D%7D",
            h.addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let entries = h.upstream.entries();
    let request = entries
        .iter()
        .find(|e| e.starts_with("GET /0?"))
        .expect("upstream playwright request");
    let query = request.split('?').nth(1).unwrap();
    assert!(query.starts_with("arg=c&arg=a&arg=b&headless=false&launch-options="));

    // the proxied request ends the session
    assert!(h
        .storage
        .list(gridrunner::catalog::Protocol::Playwright)
        .is_empty());
    assert_eq!(h.allocator.created(), 1);
}

#[tokio::test]
async fn side_port_routes_require_the_port() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    h.client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();

    // the stub browser exposes no side ports
    let resp = h
        .client
        .get(format!("http://{}/download/123", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let resp = h
        .client
        .get(format!("http://{}/clipboard/123", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
}

#[tokio::test]
async fn info_endpoints_respond() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    let resp = h
        .client
        .get(format!("http://{}/wd/hub/status", h.addr))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "value": { "ready": true } }));

    let body: Value = h
        .client
        .get(format!("http://{}/quota", h.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({ "limit": 4, "allocated": 0 }));

    let body: Value = h
        .client
        .get(format!("http://{}/info", h.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "gridrunner");
    assert_eq!(body["gitSha"], "deadbeef");

    let body: Value = h
        .client
        .get(format!("http://{}/browsers", h.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body[0]["name"], "chrome");
    assert_eq!(body[0]["defaultVersion"], "102.0");

    let body: Value = h
        .client
        .get(format!("http://{}/config", h.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["files"]["browsers.yaml"]["sha256Sum"]
        .as_str()
        .unwrap()
        .len()
        == 64);

    let raw = h
        .client
        .get(format!("http://{}/config/browsers.yaml", h.addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(raw, CATALOG);

    let resp = h
        .client
        .get(format!("http://{}/config/missing.yaml", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn status_lists_sessions_by_platform() {
    let h = spawn_broker(None, Duration::from_secs(5)).await;

    h.client
        .post(format!("http://{}/wd/hub/session", h.addr))
        .body(W3C_CREATE_BODY)
        .send()
        .await
        .unwrap();

    let body: Value = h
        .client
        .get(format!("http://{}/status", h.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["sessions"]["LINUX"][0]["id"], "123");
}
