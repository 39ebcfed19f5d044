//! Core request/response types for the gateway pipeline
//!
//! [`GatewayRequest`] is the pipeline's working representation of an inbound
//! HTTP transaction. It is created once per request at the server edge,
//! mutated only by modify stages, and discarded after the response is
//! flushed. The real URL and method are never rewritten in place: modify
//! rules write to the explicit `override_url` / `override_method` slots and
//! the proxy client reads them with override > original precedence.

use crate::sigv2::uri_encode;
use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::json;
use std::net::IpAddr;

/// An inbound HTTP request as seen by the rule engine.
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    /// HTTP method, uppercase.
    pub method: String,
    /// `http` or `https` (the scheme clients used to reach the gateway).
    pub scheme: String,
    /// Authority, possibly including an explicit port.
    pub host: String,
    /// URL path. May be empty; canonicalization treats empty as `/`.
    pub path: String,
    /// Decoded query parameters in arrival order. Duplicate keys are kept.
    pub params: Vec<(String, String)>,
    /// Request headers. `HeaderMap` gives case-insensitive lookup.
    pub headers: HeaderMap,
    /// Request body bytes.
    pub body: Bytes,
    /// Peer address of the client connection.
    pub remote_addr: Option<IpAddr>,
    /// Authenticated entity, set by the `aws_signature` filter on success.
    pub remote_user: Option<String>,
    /// Target URL overlay written by `url set`; read by the proxy client.
    pub override_url: Option<String>,
    /// Method overlay written by `method set`; read by the proxy client.
    pub override_method: Option<String>,
}

impl GatewayRequest {
    /// First value of the named query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `key` with a single `key=value` pair,
    /// appending when the key was absent.
    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        self.params.retain(|(k, _)| k != key);
        self.params.push((key.to_string(), value.into()));
    }

    /// The AWS action this request performs, if it carries one.
    pub fn aws_action(&self) -> Option<&str> {
        self.param("Action")
    }

    /// Query string re-encoded from the decoded parameters, arrival order.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Path plus `?query` when a query is present.
    pub fn path_qs(&self) -> String {
        let qs = self.query_string();
        if qs.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, qs)
        }
    }

    /// `scheme://host`.
    pub fn host_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Full request URL including the query string.
    pub fn url(&self) -> String {
        format!("{}{}", self.host_url(), self.path_qs())
    }

    /// URL the proxy client should contact: override slot wins.
    pub fn target_url(&self) -> String {
        self.override_url.clone().unwrap_or_else(|| self.url())
    }

    /// Method the proxy client should use: override slot wins.
    pub fn target_method(&self) -> &str {
        self.override_method.as_deref().unwrap_or(&self.method)
    }

    /// Named request attribute as used by match/filter rules and `$name`
    /// header templates. `None` means the attribute has no value on this
    /// request (every matchtype then evaluates false).
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "method" => Some(self.method.clone()),
            "scheme" => Some(self.scheme.clone()),
            // The gateway is always mounted at the URL root.
            "script_name" => Some(String::new()),
            "path_info" | "path" => Some(self.path.clone()),
            "remote_user" => self.remote_user.clone(),
            "remote_addr" => self.remote_addr.map(|a| a.to_string()),
            "host" => Some(self.host.clone()),
            "host_url" | "application_url" => Some(self.host_url()),
            "path_url" => Some(format!("{}{}", self.host_url(), self.path)),
            "url" => Some(self.url()),
            "path_qs" => Some(self.path_qs()),
            "query_string" => Some(self.query_string()),
            _ => None,
        }
    }

    /// Snapshot of the request for audit/notification purposes. Credential
    /// material (`Signature` values, `Authorization` headers) is redacted.
    pub fn audit_snapshot(&self) -> serde_json::Value {
        let params: Vec<serde_json::Value> = self
            .params
            .iter()
            .map(|(k, v)| {
                let v = if k == "Signature" { "[redacted]" } else { v };
                json!([k, v])
            })
            .collect();
        let headers: Vec<serde_json::Value> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let value = if *k == axum::http::header::AUTHORIZATION {
                    "[redacted]".to_string()
                } else {
                    String::from_utf8_lossy(v.as_bytes()).into_owned()
                };
                json!([k.as_str(), value])
            })
            .collect();
        json!({
            "method": self.method,
            "url": self.url(),
            "params": params,
            "headers": headers,
            "remote_addr": self.remote_addr.map(|a| a.to_string()),
            "entity": self.remote_user,
            "body_bytes": self.body.len(),
        })
    }
}

/// Response returned to the client, either proxied from upstream or produced
/// by a pipeline short-circuit (403/500/501).
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: axum::http::StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Short-circuit response with a plain-text body.
    pub fn text(status: axum::http::StatusCode, body: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("text/plain"),
        );
        Self {
            status,
            headers,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn request() -> GatewayRequest {
        GatewayRequest {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "gate.example.com".to_string(),
            path: "/foo/bar".to_string(),
            params: vec![
                ("Action".to_string(), "ListUsers".to_string()),
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "b".to_string()),
            ],
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_param_returns_first_value() {
        let req = request();
        assert_eq!(req.param("tag"), Some("a"));
        assert_eq!(req.param("missing"), None);
    }

    #[test]
    fn test_set_param_replaces_all_occurrences() {
        let mut req = request();
        req.set_param("tag", "c");
        let tags: Vec<_> = req.params.iter().filter(|(k, _)| k == "tag").collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(req.param("tag"), Some("c"));
    }

    #[test]
    fn test_aws_action() {
        assert_eq!(request().aws_action(), Some("ListUsers"));
    }

    #[test]
    fn test_url_attributes() {
        let req = request();
        assert_eq!(
            req.attribute("host_url").as_deref(),
            Some("http://gate.example.com")
        );
        assert_eq!(
            req.attribute("path_url").as_deref(),
            Some("http://gate.example.com/foo/bar")
        );
        assert_eq!(
            req.attribute("url").as_deref(),
            Some("http://gate.example.com/foo/bar?Action=ListUsers&tag=a&tag=b")
        );
        assert_eq!(
            req.attribute("path_qs").as_deref(),
            Some("/foo/bar?Action=ListUsers&tag=a&tag=b")
        );
        assert_eq!(req.attribute("script_name").as_deref(), Some(""));
    }

    #[test]
    fn test_missing_attribute_is_none() {
        let req = request();
        assert_eq!(req.attribute("remote_user"), None);
        assert_eq!(req.attribute("no_such_attr"), None);
    }

    #[test]
    fn test_target_precedence() {
        let mut req = request();
        assert_eq!(req.target_method(), "GET");
        assert!(req.target_url().starts_with("http://gate.example.com"));

        req.override_url = Some("https://iam.amazonaws.com/".to_string());
        req.override_method = Some("POST".to_string());
        assert_eq!(req.target_url(), "https://iam.amazonaws.com/");
        assert_eq!(req.target_method(), "POST");
    }

    #[test]
    fn test_audit_snapshot_redacts_credentials() {
        let mut req = request();
        req.params
            .push(("Signature".to_string(), "c2VjcmV0".to_string()));
        req.headers.insert(
            axum::http::header::AUTHORIZATION,
            "AWS AKID:sig".parse().unwrap(),
        );
        let dump = serde_json::to_string(&req.audit_snapshot()).unwrap();
        assert!(!dump.contains("c2VjcmV0"));
        assert!(!dump.contains("AKID"));
        assert!(dump.contains("[redacted]"));
    }

    #[test]
    fn test_text_response() {
        let resp = GatewayResponse::text(StatusCode::FORBIDDEN, "Verboten\n");
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert_eq!(resp.body.as_ref(), b"Verboten\n");
    }
}
