//! Reverse-proxy plumbing: upstream URL building, the path rewrite table and
//! buffered request forwarding.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::error::{Error, W3cError};

/// Closed rewrite table applied to proxied WebDriver paths as a suffix
/// substitution.
const REWRITE_RULES: [(&str, &str); 1] = [("/se/file", "/file")];

/// How proxy failures are rendered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStyle {
    /// W3C-shaped JSON error body.
    Webdriver,
    /// Single-line text body.
    Plain,
}

/// Render a broker error in the given style.
pub fn render_error(style: ErrorStyle, tag: &str, err: &Error) -> Response {
    match style {
        ErrorStyle::Webdriver => {
            (err.status(), axum::Json(W3cError::new(tag, err))).into_response()
        }
        ErrorStyle::Plain => (err.status(), err.to_string()).into_response(),
    }
}

pub fn apply_rewrite_rules(path: &str) -> String {
    for (from, to) in REWRITE_RULES {
        if let Some(prefix) = path.strip_suffix(from) {
            return format!("{prefix}{to}");
        }
    }
    path.to_string()
}

/// Rebuild the upstream URL for a session route: the browser URL joined with
/// the route prefix, the session id and the request's trailing path, query
/// preserved.
pub fn session_url(
    browser_url: &Url,
    prefix: &str,
    session_id: &str,
    rest: &str,
    query: Option<&str>,
) -> Url {
    let mut url = browser_url.clone();
    let mut path = format!(
        "{}{}/{}",
        url.path().trim_end_matches('/'),
        prefix,
        session_id
    );
    if !rest.is_empty() {
        path.push('/');
        path.push_str(rest);
    }
    url.set_path(&apply_rewrite_rules(&path));
    url.set_query(query);
    url
}

/// Upstream URL for a side-port route: plain http to the port's address plus
/// the trailing path.
pub fn port_url(host_port: &str, rest: &str, query: Option<&str>) -> Result<Url, Error> {
    let path = if rest.is_empty() {
        String::new()
    } else {
        format!("/{rest}")
    };
    let mut url = Url::parse(&format!("http://{host_port}{path}"))
        .map_err(|e| Error::internal(format!("failed to build side-port url: {e}")))?;
    url.set_query(query);
    Ok(url)
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Forward one buffered request upstream, overriding `Host` with the
/// browser's display host. Transport failures come back as 502 in the given
/// error style.
pub async fn forward(
    client: &reqwest::Client,
    method: Method,
    url: Url,
    host: &str,
    headers: &HeaderMap,
    body: Bytes,
    style: ErrorStyle,
) -> Response {
    let mut request = client.request(method, url.clone());
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == &header::HOST {
            continue;
        }
        request = request.header(name.clone(), value.clone());
    }
    request = request.header(header::HOST, host);
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(url = %url, error = %err, "proxy error");
            return render_error(
                style,
                "proxy error",
                &Error::internal(format!("proxy error: {err}")),
            )
            .with_status(StatusCode::BAD_GATEWAY);
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(url = %url, error = %err, "failed to read upstream response");
            return render_error(
                style,
                "proxy error",
                &Error::internal(format!("proxy error: {err}")),
            )
            .with_status(StatusCode::BAD_GATEWAY);
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &upstream_headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response = response.header(name.clone(), value.clone());
    }
    response
        .body(axum::body::Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

trait WithStatus {
    fn with_status(self, status: StatusCode) -> Response;
}

impl WithStatus for Response {
    fn with_status(mut self, status: StatusCode) -> Response {
        *self.status_mut() = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_applies_as_suffix_substitution() {
        assert_eq!(apply_rewrite_rules("/session/1/se/file"), "/session/1/file");
        assert_eq!(apply_rewrite_rules("/session/1/se/files"), "/session/1/se/files");
        assert_eq!(apply_rewrite_rules("/se/file/extra"), "/se/file/extra");
        assert_eq!(apply_rewrite_rules("/plain"), "/plain");
    }

    #[test]
    fn session_url_joins_prefix_id_and_rest() {
        let base = Url::parse("http://10.0.0.5:4444/wd/hub").unwrap();
        let url = session_url(&base, "/session", "abc", "url", Some("q=1"));
        assert_eq!(url.as_str(), "http://10.0.0.5:4444/wd/hub/session/abc/url?q=1");

        let url = session_url(&base, "/session", "abc", "", None);
        assert_eq!(url.as_str(), "http://10.0.0.5:4444/wd/hub/session/abc");

        // the rewrite table applies to the rebuilt path
        let url = session_url(&base, "/session", "abc", "se/file", None);
        assert_eq!(url.as_str(), "http://10.0.0.5:4444/wd/hub/session/abc/file");
    }

    #[test]
    fn port_url_shapes() {
        let url = port_url("10.0.0.5:8080", "", None).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/");
        let url = port_url("10.0.0.5:8080", "some/file.png", Some("json=true")).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/some/file.png?json=true");
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn hop_by_hop_headers_filtered() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }
}
