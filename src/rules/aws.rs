//! AWS signing rules
//!
//! `aws_signature` (filter) verifies an inbound SigV2 signature against a
//! credentials file and records the signing entity on the request.
//! `aws_sign` (modify) strips the client's credentials and re-signs the
//! outbound request with the privileged upstream key, so per-user keys never
//! leave the gateway and the shared secret never reaches clients.

use super::{FilterRule, HttpMessage, RuleLine, RuleRegistry, TransformRule};
use crate::config::ConfigError;
use crate::credentials::CredentialStore;
use crate::error::GatewayError;
use crate::sigv2::{
    self, SignatureMethod, Verifier, DEFAULT_MAX_SIGNATURE_AGE, SIGNATURE_VERSION,
};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub(super) fn register(registry: &mut RuleRegistry) {
    registry.register_filter("aws_signature", |line| {
        let creds = line.require_kwarg("creds")?;
        let store = CredentialStore::load(Path::new(creds))?;
        let max_signature_age = match line.kwarg("max_signature_age") {
            Some(value) => value.parse::<u64>().map_err(|_| {
                ConfigError::rule(&line.raw, "max_signature_age must be a number of seconds")
            })?,
            None => DEFAULT_MAX_SIGNATURE_AGE,
        };
        Ok(Box::new(AwsSignatureFilter {
            verifier: Verifier::new(Arc::new(store), max_signature_age),
        }))
    });

    registry.register_modify("aws_sign", |line| {
        let creds = line.require_kwarg("creds")?;
        let key = line.require_kwarg("key")?;
        let method_name = line.kwarg("signature_method").unwrap_or("HmacSHA256");
        let version = line.kwarg("signature_version").unwrap_or(SIGNATURE_VERSION);
        let method = SignatureMethod::resolve(method_name, version).map_err(|_| {
            ConfigError::rule(
                &line.raw,
                format!("invalid signature method or version: {method_name} v{version}"),
            )
        })?;

        let store = CredentialStore::load(Path::new(creds))?;
        let credential = store.for_key(key).ok_or_else(|| {
            ConfigError::rule(&line.raw, format!("key {key:?} is missing from {creds}"))
        })?;

        Ok(Box::new(AwsSignRule {
            key: credential.key.clone(),
            secret: credential.secret.clone(),
            method,
        }))
    });
}

/// Filter: permit iff the request carries a valid SigV2 signature from a
/// known credential.
struct AwsSignatureFilter {
    verifier: Verifier,
}

impl FilterRule for AwsSignatureFilter {
    fn permit(&self, request: &mut crate::types::GatewayRequest) -> Result<bool, GatewayError> {
        match self.verifier.authenticate(request) {
            Ok(entity) => {
                request.remote_user = Some(entity);
                Ok(true)
            }
            Err(GatewayError::Unauthenticated(reason)) => {
                debug!(%reason, "rejecting request with invalid signature");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }
}

/// Modify: re-sign the outbound request with the privileged credential.
struct AwsSignRule {
    key: String,
    secret: String,
    method: SignatureMethod,
}

impl AwsSignRule {
    fn form_encoded(request: &crate::types::GatewayRequest) -> bool {
        request
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim() == "application/x-www-form-urlencoded")
            .unwrap_or(false)
    }
}

impl TransformRule for AwsSignRule {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError> {
        let request = message.request_mut("aws_sign")?;

        // The client's header-based credentials must not leak upstream.
        request.headers.remove(axum::http::header::AUTHORIZATION);

        request.set_param("AWSAccessKeyId", self.key.clone());
        request.set_param("SignatureVersion", SIGNATURE_VERSION);
        request.set_param("SignatureMethod", self.method.wire_name());
        request.set_param("Timestamp", sigv2::generate_timestamp());

        let canonical = sigv2::canonical_query(&request.params);
        let base = sigv2::base_string(
            &request.method,
            &request.scheme,
            &request.host,
            &request.path,
            &request.params,
        );
        let signature = sigv2::uri_encode(&self.method.sign(&self.secret, &base));

        if Self::form_encoded(request) {
            // POST-based AWS APIs expect the signed parameters in the
            // form-encoded body, not the URL.
            request.body = Bytes::from(format!("{canonical}&Signature={signature}"));
        } else {
            let target = request.target_url();
            let base_url = target.split('?').next().unwrap_or(&target).to_string();
            request.override_url = Some(format!("{base_url}?{canonical}&Signature={signature}"));
        }

        info!(
            key = %self.key,
            method = self.method.wire_name(),
            action = request.aws_action().unwrap_or("-"),
            "re-signed outbound request"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StageKind;
    use crate::types::GatewayRequest;
    use std::io::Write;

    const CLIENT_CREDS: &str = "---\nname: alice@example.com\nkey: CLIENTKEY\nsecret: clientsecret\n";
    const UPSTREAM_CREDS: &str = "---\nname: upstream\nkey: REALKEY\nsecret: realsecret\n";

    fn creds_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn signed_client_request(secret: &str) -> GatewayRequest {
        let mut request = GatewayRequest {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "gate.example.com".to_string(),
            path: "/".to_string(),
            params: vec![
                ("Action".to_string(), "ListUsers".to_string()),
                ("AWSAccessKeyId".to_string(), "CLIENTKEY".to_string()),
                ("SignatureMethod".to_string(), "HmacSHA256".to_string()),
                ("SignatureVersion".to_string(), "2".to_string()),
                ("Timestamp".to_string(), sigv2::generate_timestamp()),
            ],
            ..Default::default()
        };
        let base = sigv2::base_string(
            &request.method,
            &request.scheme,
            &request.host,
            &request.path,
            &request.params,
        );
        let signature = SignatureMethod::HmacSha256.sign(secret, &base);
        request.set_param("Signature", signature);
        request
    }

    fn compile_filter(line: &str) -> Box<dyn FilterRule> {
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(line, StageKind::Filter).unwrap();
        registry.compile_filter(&parsed).unwrap()
    }

    fn compile_modify(line: &str) -> Box<dyn TransformRule> {
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(line, StageKind::ModifyRequest).unwrap();
        registry.compile_modify(&parsed).unwrap()
    }

    #[test]
    fn test_aws_signature_permits_valid_request_and_sets_entity() {
        let creds = creds_file(CLIENT_CREDS);
        let rule = compile_filter(&format!(
            "permit aws_signature creds={}",
            creds.path().display()
        ));

        let mut request = signed_client_request("clientsecret");
        assert!(rule.permit(&mut request).unwrap());
        assert_eq!(request.remote_user.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_aws_signature_rejects_wrong_secret() {
        let creds = creds_file(CLIENT_CREDS);
        let rule = compile_filter(&format!(
            "permit aws_signature creds={}",
            creds.path().display()
        ));

        let mut request = signed_client_request("wrongsecret");
        assert!(!rule.permit(&mut request).unwrap());
        assert!(request.remote_user.is_none());
    }

    #[test]
    fn test_aws_signature_rejects_unsigned_request() {
        let creds = creds_file(CLIENT_CREDS);
        let rule = compile_filter(&format!(
            "permit aws_signature creds={}",
            creds.path().display()
        ));

        let mut request = GatewayRequest {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "gate.example.com".to_string(),
            path: "/".to_string(),
            ..Default::default()
        };
        assert!(!rule.permit(&mut request).unwrap());
    }

    #[test]
    fn test_aws_signature_missing_creds_file_is_config_error() {
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(
            "permit aws_signature creds=/no/such/file.creds",
            StageKind::Filter,
        )
        .unwrap();
        assert!(registry.compile_filter(&parsed).is_err());
    }

    #[test]
    fn test_aws_sign_requires_known_key() {
        let creds = creds_file(UPSTREAM_CREDS);
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(
            &format!("aws_sign creds={} key=WRONG", creds.path().display()),
            StageKind::ModifyRequest,
        )
        .unwrap();
        assert!(registry.compile_modify(&parsed).is_err());
    }

    #[test]
    fn test_aws_sign_rewrites_url_with_privileged_signature() {
        let creds = creds_file(UPSTREAM_CREDS);
        let rule = compile_modify(&format!(
            "aws_sign creds={} key=REALKEY",
            creds.path().display()
        ));

        let mut message = HttpMessage::Request(signed_client_request("clientsecret"));
        rule.apply(&mut message).unwrap();
        let request = match message {
            HttpMessage::Request(r) => r,
            _ => unreachable!(),
        };

        let url = request.override_url.expect("override_url written");
        assert!(url.contains("AWSAccessKeyId=REALKEY"));
        assert!(url.contains("&Signature="));
        // The client's signature is not carried into the rewritten query.
        assert!(!url.contains("AWSAccessKeyId=CLIENTKEY"));

        // Verify the rewritten parameters against the upstream secret.
        let query = url.split_once('?').unwrap().1;
        let params: Vec<(String, String)> = query
            .split('&')
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap();
                (sigv2::percent_decode(k), sigv2::percent_decode(v))
            })
            .collect();
        let signature = params
            .iter()
            .find(|(k, _)| k == "Signature")
            .map(|(_, v)| v.clone())
            .unwrap();
        let base = sigv2::base_string(
            &request.method,
            &request.scheme,
            &request.host,
            &request.path,
            &params,
        );
        assert_eq!(
            SignatureMethod::HmacSha256.sign("realsecret", &base),
            signature
        );
    }

    #[test]
    fn test_aws_sign_form_encoded_body_branch() {
        let creds = creds_file(UPSTREAM_CREDS);
        let rule = compile_modify(&format!(
            "aws_sign creds={} key=REALKEY",
            creds.path().display()
        ));

        let mut request = signed_client_request("clientsecret");
        request.method = "POST".to_string();
        request.headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded; charset=utf-8".parse().unwrap(),
        );

        let mut message = HttpMessage::Request(request);
        rule.apply(&mut message).unwrap();
        let request = match message {
            HttpMessage::Request(r) => r,
            _ => unreachable!(),
        };

        // Signed parameters land in the body, not the URL.
        assert!(request.override_url.is_none());
        let body = String::from_utf8(request.body.to_vec()).unwrap();
        assert!(body.contains("AWSAccessKeyId=REALKEY"));
        assert!(body.contains("&Signature="));
    }

    #[test]
    fn test_aws_sign_removes_authorization_header() {
        let creds = creds_file(UPSTREAM_CREDS);
        let rule = compile_modify(&format!(
            "aws_sign creds={} key=REALKEY",
            creds.path().display()
        ));

        let mut request = signed_client_request("clientsecret");
        request.headers.insert(
            axum::http::header::AUTHORIZATION,
            "AWS CLIENTKEY:abc".parse().unwrap(),
        );
        let mut message = HttpMessage::Request(request);
        rule.apply(&mut message).unwrap();
        assert!(message
            .headers_mut()
            .get(axum::http::header::AUTHORIZATION)
            .is_none());
    }

    #[test]
    fn test_aws_sign_discards_existing_override_query() {
        let creds = creds_file(UPSTREAM_CREDS);
        let rule = compile_modify(&format!(
            "aws_sign creds={} key=REALKEY",
            creds.path().display()
        ));

        let mut request = signed_client_request("clientsecret");
        request.override_url =
            Some("https://iam.amazonaws.com/?stale=query".to_string());
        let mut message = HttpMessage::Request(request);
        rule.apply(&mut message).unwrap();
        let request = match message {
            HttpMessage::Request(r) => r,
            _ => unreachable!(),
        };

        let url = request.override_url.unwrap();
        assert!(url.starts_with("https://iam.amazonaws.com/?"));
        assert!(!url.contains("stale=query"));
    }
}
