//! HTTP edge: proxy listener and control listener
//!
//! The proxy listener accepts every method on every path and feeds the
//! pipeline. The control listener lives on its own port and carries the
//! side channels that must keep working while requests are time-locked:
//! cancellation links, health and metrics.

use crate::metrics::Metrics;
use crate::pipeline::Gateway;
use crate::sigv2::percent_decode;
use crate::timelock::{MemoryTimeLockStore, TimeLockError, TimeLockStore};
use crate::types::GatewayRequest;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on buffered request bodies.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct ProxyState {
    gateway: Arc<Gateway>,
    scheme: String,
}

/// Router for the main proxy listener: every request, any method, any
/// path, goes through the pipeline.
pub fn proxy_router(gateway: Arc<Gateway>, scheme: String) -> Router {
    Router::new()
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ProxyState { gateway, scheme })
}

async fn gateway_handler(
    State(state): State<ProxyState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let mut params = parse_query(parts.uri.query().unwrap_or(""));
    // Form-encoded bodies carry parameters too (POST-based AWS APIs sign
    // and send them there).
    let form_encoded = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "application/x-www-form-urlencoded")
        .unwrap_or(false);
    if form_encoded {
        params.extend(parse_query(&String::from_utf8_lossy(&body)));
    }

    let gateway_request = GatewayRequest {
        method: parts.method.as_str().to_string(),
        scheme: state.scheme.clone(),
        host,
        path: percent_decode(parts.uri.path()),
        params,
        headers: parts.headers,
        body,
        remote_addr: Some(addr.ip()),
        remote_user: None,
        override_url: None,
        override_method: None,
    };

    let gateway_response = state.gateway.handle(gateway_request).await;

    let mut builder = Response::builder().status(gateway_response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = gateway_response.headers;
        // Hop-by-hop and framing headers are the server's business.
        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONTENT_LENGTH);
    }
    builder
        .body(Body::from(gateway_response.body))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Decode a query string (or form-encoded body) into ordered key/value
/// pairs. Duplicate keys are kept; `+` decodes to a space.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn decode_component(component: &str) -> String {
    percent_decode(&component.replace('+', " "))
}

#[derive(Clone)]
struct ControlState {
    store: Arc<MemoryTimeLockStore>,
    metrics: Arc<Metrics>,
}

/// Router for the control listener.
pub fn control_router(store: Arc<MemoryTimeLockStore>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(export_metrics))
        .route("/timelocks/:id/cancel", post(cancel_timelock))
        .with_state(ControlState { store, metrics })
}

async fn health() -> &'static str {
    "OK"
}

async fn export_metrics(State(state): State<ControlState>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
        .into_response()
}

async fn cancel_timelock(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Response {
    let id = match id.parse::<Uuid>() {
        Ok(id) => id,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "malformed time lock id\n").into_response();
        }
    };

    match state.store.set_cancelled(id).await {
        Ok(()) => {
            info!(%id, "time lock cancelled via control listener");
            state.metrics.timelocks_cancelled_total.inc();
            (StatusCode::OK, "cancelled\n").into_response()
        }
        Err(TimeLockError::Unknown(_)) => {
            (StatusCode::NOT_FOUND, "unknown time lock\n").into_response()
        }
        Err(e) => {
            warn!(error = %e, "time lock cancellation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "cancellation failed\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_preserves_order_and_duplicates() {
        let params = parse_query("b=2&a=1&a=3");
        assert_eq!(
            params,
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_query_decoding() {
        let params = parse_query("Timestamp=2011-01-01T00%3A00%3A00&note=a+b%2Bc");
        assert_eq!(params[0].1, "2011-01-01T00:00:00");
        assert_eq!(params[1].1, "a b+c");
    }

    #[test]
    fn test_parse_query_valueless_and_empty_pairs() {
        let params = parse_query("flag&&x=");
        assert_eq!(
            params,
            vec![
                ("flag".to_string(), String::new()),
                ("x".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_control_listener_cancellation_flow() {
        let store = Arc::new(MemoryTimeLockStore::new());
        let metrics = Arc::new(Metrics::new());
        let id = Uuid::new_v4();
        store.insert(id).await.unwrap();

        let app = control_router(store.clone(), metrics);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status().as_u16(), 200);

        let cancel = client
            .post(format!("{base}/timelocks/{id}/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(cancel.status().as_u16(), 200);
        assert!(store.get(id).await.unwrap().unwrap().cancelled);

        let unknown = client
            .post(format!("{base}/timelocks/{}/cancel", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let malformed = client
            .post(format!("{base}/timelocks/not-a-uuid/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status().as_u16(), 400);

        let metrics_text = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics_text.contains("goldengate_timelocks_cancelled_total 1"));
    }
}
