//! Public-facing HTTP listener.
//!
//! Every inbound request is translated into a [`PublicRequest`], handed
//! to the [`Correlator`], and the agent's [`ResponseData`] is translated
//! back into an axum response. Grounded on the teacher's `proxy_handler`
//! fallback route, generalized to forward through the control-channel
//! correlator instead of a WebSocket tunnel.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tracing::warn;

use relay_protocol::body;

use crate::correlator::{Correlator, CorrelatorError, PublicRequest};
use crate::routing::RoutingTable;

#[derive(Clone)]
pub struct HttpState {
    pub routing: Arc<RoutingTable>,
    pub correlator: Arc<Correlator>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .fallback(any(proxy))
        .with_state(state)
}

async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let active = state.routing.len().await;
    axum::Json(serde_json::json!({ "status": "ok", "active_sessions": active }))
}

/// Derives the subdomain a Host header resolves to: the first
/// dot-separated label. A bare host with no dot yields an empty
/// subdomain, which simply won't resolve to any registered tunnel.
fn subdomain_of(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    match host.split_once('.') {
        Some((label, _)) => label.to_string(),
        None => String::new(),
    }
}

/// Appends `; charset=utf-8` to a `text/html` or `text/plain`
/// Content-Type that doesn't already carry a charset, so browsers don't
/// fall back to guessing the agent response's encoding.
fn normalize_text_charset(content_type: &str) -> String {
    let lower = content_type.to_ascii_lowercase();
    let base = lower.split(';').next().unwrap_or("").trim();
    if (base == "text/html" || base == "text/plain") && !lower.contains("charset=") {
        format!("{content_type}; charset=utf-8")
    } else {
        content_type.to_string()
    }
}

/// Splits a leading `/<candidate>/...` segment off a path for the
/// path-prefix fallback. The remainder always starts with `/`, even when
/// nothing follows the candidate segment (never an empty string).
fn split_path_prefix(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/')?;
    let (first, rest) = match trimmed.split_once('/') {
        Some((f, r)) => (f, r),
        None => (trimmed, ""),
    };
    if first.is_empty() {
        return None;
    }
    let rest_path = if rest.is_empty() { "/".to_string() } else { format!("/{rest}") };
    Some((first, rest_path))
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}

async fn proxy(State(state): State<HttpState>, req: Request) -> Response {
    let start = Instant::now();

    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let explicit_tunnel = req
        .headers()
        .get("x-tunnel-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let subdomain = subdomain_of(&host);
    let method = req.method().to_string();
    let uri_path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    if uri_path == "/" && state.routing.len().await == 0 {
        return (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            "relay server is up; no tunnels are currently registered",
        )
            .into_response();
    }
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();

    let body = match axum::body::to_bytes(req.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!("failed to buffer request body: {e}");
            return (StatusCode::BAD_REQUEST, "could not read request body").into_response();
        }
    };

    let (tunnel_id, path) = match state
        .correlator
        .resolve_tunnel_id(explicit_tunnel.as_deref(), &subdomain)
        .await
    {
        Some(id) => (id, with_query(&uri_path, query.as_deref())),
        None => match split_path_prefix(&uri_path) {
            Some((candidate, rest)) if state.routing.find_by_tunnel(candidate).await.is_some() => {
                (candidate.to_string(), with_query(&rest, query.as_deref()))
            }
            _ => return (StatusCode::NOT_FOUND, "no tunnel registered for this host").into_response(),
        },
    };

    let request = PublicRequest {
        tunnel_id,
        method,
        path,
        headers,
        body,
    };

    match state.correlator.dispatch(request.clone()).await {
        Ok(data) => {
            let status = StatusCode::from_u16(data.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            if let Some(headers_mut) = builder.headers_mut() {
                for (k, v) in &data.headers {
                    let value = if k.eq_ignore_ascii_case("content-type") {
                        normalize_text_charset(v)
                    } else {
                        v.clone()
                    };
                    if let (Ok(name), Ok(value)) =
                        (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&value))
                    {
                        headers_mut.insert(name, value);
                    }
                }
            }
            let body_bytes = body::decode(data.is_binary, &data.body);
            let latency_ms = start.elapsed().as_millis() as u64;
            state
                .correlator
                .observer()
                .on_request_completed(&request, status.as_u16(), latency_ms);
            builder
                .body(Body::from(body_bytes))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response())
        }
        Err(err) => {
            state.correlator.observer().on_request_failed(&request, &err.to_string());
            let status = match err {
                CorrelatorError::NoSuchTunnel => StatusCode::NOT_FOUND,
                CorrelatorError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                CorrelatorError::SessionClosed => StatusCode::BAD_GATEWAY,
                CorrelatorError::AgentError(_) => StatusCode::BAD_GATEWAY,
                CorrelatorError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, err.to_string()).into_response()
        }
    }
}
