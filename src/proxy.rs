//! Upstream proxy client
//!
//! Forwards one request to the upstream API and returns the response
//! verbatim. Connections are deliberately single-use: `Connection: close`
//! goes out with every request and the pool keeps no idle sockets, so a
//! misbehaving upstream can never wedge a shared connection. Every exchange
//! runs under a configurable deadline.

use crate::error::GatewayError;
use crate::types::{GatewayRequest, GatewayResponse};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderValue;
use reqwest::redirect;
use std::time::Duration;
use tracing::debug;

/// HTTP client for upstream exchanges.
pub struct ProxyClient {
    client: reqwest::Client,
}

impl ProxyClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // No keep-alive reuse: one connection per exchange.
            .pool_max_idle_per_host(0)
            // Redirects are the client's business; pass them through.
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward the request to its target and collect the full response.
    /// The target URL and method honour the override slots.
    pub async fn forward(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let url = request.target_url();
        let method = reqwest::Method::from_bytes(request.target_method().as_bytes())
            .map_err(|_| {
                GatewayError::Upstream(format!("invalid method {:?}", request.target_method()))
            })?;

        let mut headers = request.headers.clone();
        // An empty content type confuses upstreams more than an absent one.
        if headers
            .get(CONTENT_TYPE)
            .is_some_and(|v| v.as_bytes().is_empty())
        {
            headers.remove(CONTENT_TYPE);
        }
        // The connection targets the rewritten URL, not the gateway.
        headers.remove(axum::http::header::HOST);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(request.body.len() as u64));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        debug!(%url, method = %method, "forwarding upstream");

        let response = self
            .client
            .request(method, url.as_str())
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(format!("reading upstream body: {e}")))?;

        debug!(%url, status = status.as_u16(), bytes = body.len(), "upstream answered");

        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}
