//! WebDriver HTTP surface: session create/delete, the per-session reverse
//! proxy and the side-port routes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{Capabilities, WebdriverCapabilities};
use crate::catalog::{ContainerPort, Protocol};
use crate::error::{Error, BAD_SESSION_PARAMETERS, SESSION_NOT_CREATED};
use crate::event::{released_event, requested_event};
use crate::server::proxy::{
    forward, is_websocket_upgrade, port_url, render_error, session_url, ErrorStyle,
};
use crate::server::{tunnel, AppState};
use crate::session::Session;

pub async fn create_session(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let caps = match WebdriverCapabilities::parse(&body, state.default_proxy.as_ref()) {
        Ok(caps) => Arc::new(caps),
        Err(err) => {
            state.broker.publish(requested_event(
                Protocol::Webdriver,
                "",
                "",
                None,
                Some(err.to_string()),
            ));
            return render_error(ErrorStyle::Webdriver, BAD_SESSION_PARAMETERS, &err);
        }
    };

    let name = caps.name().to_string();
    let version = caps.version().to_string();
    let start = std::time::Instant::now();

    // the guard cancels the token when this handler future is dropped, which
    // is how a client disconnect looks from here; the create task below
    // keeps running, observes the token and cleans up after itself
    let cancel = CancellationToken::new();
    let _disconnect_guard = cancel.clone().drop_guard();

    // run the create on its own task so a panic surfaces as an internal
    // error instead of tearing the connection down; the task also publishes
    // the outcome so a vanished client still leaves a canceled event behind
    let service = Arc::clone(&state.wd);
    let broker = Arc::clone(&state.broker);
    let task_caps = Arc::clone(&caps);
    let task_name = name.clone();
    let task_version = version.clone();
    let result = tokio::spawn(async move {
        let result = service.create_session(task_caps, cancel).await;
        match &result {
            Ok(_) => broker.publish(requested_event(
                Protocol::Webdriver,
                &task_name,
                &task_version,
                Some(start.elapsed()),
                None,
            )),
            Err(err) => {
                tracing::error!(error = %err, "failed to create session");
                broker.publish(requested_event(
                    Protocol::Webdriver,
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

    match result {
        Ok(Ok(session)) => {
            let body = session.response().cloned().unwrap_or(json!(null));
            Json(body).into_response()
        }
        Ok(Err(err)) => render_error(ErrorStyle::Webdriver, SESSION_NOT_CREATED, &err),
        Err(join_err) => {
            let err = Error::internal(format!("panic: {join_err}"));
            tracing::error!(error = %err, "create session panicked");
            state.broker.publish(requested_event(
                Protocol::Webdriver,
                &name,
                &version,
                None,
                Some(err.to_string()),
            ));
            render_error(ErrorStyle::Webdriver, SESSION_NOT_CREATED, &err)
        }
    }
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match find(&state, &session_id) {
        Ok(session) => session,
        Err(resp) => return resp,
    };

    let released = released_event(
        Protocol::Webdriver,
        session.caps().name(),
        session.caps().version(),
        session.created().elapsed(),
    );
    state.wd.delete_session(&session).await;
    state.broker.publish(released);

    Json(json!({ "value": null })).into_response()
}

/// `ANY /wd/hub/session/:sess/*rest` - rewrite and forward to the workload.
pub async fn proxy_session(
    State(state): State<Arc<AppState>>,
    Path((session_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let session = match find(&state, &session_id) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let browser = session.browser();
    let url = session_url(
        browser.url(),
        "/session",
        &session_id,
        &rest,
        req.uri().query(),
    );

    if is_websocket_upgrade(req.headers()) {
        if let Some(ws) = ws {
            let mut ws_url = url.clone();
            let _ = ws_url.set_scheme("ws");
            return ws
                .on_upgrade(move |socket| tunnel::ws_to_ws(socket, ws_url.to_string(), None));
        }
    }

    let host = browser.host().to_string();
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return render_error(
                ErrorStyle::Webdriver,
                "proxy error",
                &Error::internal(format!("failed to read request body: {err}")),
            )
        }
    };
    forward(
        &state.client,
        parts.method,
        url,
        &host,
        &parts.headers,
        body,
        ErrorStyle::Webdriver,
    )
    .await
}

/// `GET /vnc/:sess` - byte tunnel onto the workload's VNC port.
pub async fn vnc(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let session = match find(&state, &session_id) {
        Ok(session) => session,
        Err(resp) => return resp,
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
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| tunnel::ws_to_tcp(socket, addr, None)),
        None => (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response(),
    }
}

pub async fn download(
    state: State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    port_proxy(state, session_id, String::new(), ContainerPort::Fileserver, ws, req).await
}

pub async fn download_path(
    state: State<Arc<AppState>>,
    Path((session_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    port_proxy(state, session_id, rest, ContainerPort::Fileserver, ws, req).await
}

pub async fn clipboard(
    state: State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    port_proxy(state, session_id, String::new(), ContainerPort::Clipboard, ws, req).await
}

pub async fn devtools(
    state: State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    port_proxy(state, session_id, String::new(), ContainerPort::Devtools, ws, req).await
}

pub async fn devtools_path(
    state: State<Arc<AppState>>,
    Path((session_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    port_proxy(state, session_id, rest, ContainerPort::Devtools, ws, req).await
}

/// Shared side-port proxy: resolve the session, pick the port address and
/// either forward plain HTTP or relay a WebSocket upgrade (devtools).
async fn port_proxy(
    State(state): State<Arc<AppState>>,
    session_id: String,
    rest: String,
    port: ContainerPort,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let session = match find(&state, &session_id) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let host_port = match session.browser().host_port(port) {
        Some(host_port) => host_port,
        None => {
            return render_error(
                ErrorStyle::Plain,
                "",
                &Error::service_unavailable(format!(
                    "port {port} is not supported or not enabled"
                )),
            )
        }
    };
    let url = match port_url(&host_port, &rest, req.uri().query()) {
        Ok(url) => url,
        Err(err) => return render_error(ErrorStyle::Plain, "", &err),
    };

    if is_websocket_upgrade(req.headers()) {
        if let Some(ws) = ws {
            let mut ws_url = url.clone();
            let _ = ws_url.set_scheme("ws");
            return ws
                .on_upgrade(move |socket| tunnel::ws_to_ws(socket, ws_url.to_string(), None));
        }
    }

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return render_error(
                ErrorStyle::Plain,
                "",
                &Error::internal(format!("failed to read request body: {err}")),
            )
        }
    };
    forward(
        &state.client,
        parts.method,
        url,
        &host_port,
        &parts.headers,
        body,
        ErrorStyle::Plain,
    )
    .await
}

fn find(state: &AppState, session_id: &str) -> Result<Arc<Session>, Response> {
    state.wd.find_session(session_id).map_err(|err| {
        render_error(ErrorStyle::Webdriver, "unknown session", &err)
    })
}
