//! AWS Signature Version 2 signing and verification
//!
//! SigV2 authenticates a request through query-string parameters rather than
//! an `Authorization` header. The signature is computed over a canonical
//! base string of exactly four newline-joined lines:
//!
//! ```text
//! HTTP-Verb + "\n" +
//! lowercase(host, default port stripped) + "\n" +
//! path (or "/" when empty) + "\n" +
//! sorted, percent-encoded query parameters excluding Signature
//! ```
//!
//! and `Signature = Base64(HMAC(secret, base_string))` with SHA-1 or SHA-256
//! selected by the `SignatureMethod` parameter. Verification recomputes the
//! signature from the presented parameters and compares in constant time.

use crate::credentials::CredentialStore;
use crate::error::GatewayError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// The only signature version this engine speaks.
pub const SIGNATURE_VERSION: &str = "2";

/// Wire format of the `Timestamp` and `Expires` parameters (UTC, no zone
/// suffix).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Default acceptance window for request timestamps, in seconds.
pub const DEFAULT_MAX_SIGNATURE_AGE: u64 = 300;

/// Query parameters every signed request must carry.
pub const REQUIRED_PARAMS: [&str; 5] = [
    "AWSAccessKeyId",
    "Signature",
    "SignatureMethod",
    "SignatureVersion",
    "Timestamp",
];

/// HMAC hash selection, named as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    HmacSha256,
}

impl SignatureMethod {
    /// Wire name carried in the `SignatureMethod` parameter.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HmacSHA1",
            SignatureMethod::HmacSha256 => "HmacSHA256",
        }
    }

    /// Resolve a (method, version) pair from request parameters.
    pub fn resolve(name: &str, version: &str) -> Result<Self, GatewayError> {
        if version != SIGNATURE_VERSION {
            return Err(GatewayError::Unauthenticated(
                "invalid signature method or version".to_string(),
            ));
        }
        match name {
            "HmacSHA1" => Ok(SignatureMethod::HmacSha1),
            "HmacSHA256" => Ok(SignatureMethod::HmacSha256),
            _ => Err(GatewayError::Unauthenticated(
                "invalid signature method or version".to_string(),
            )),
        }
    }

    /// `Base64(HMAC(secret, base_string))`. The secret is used as the raw
    /// UTF-8 bytes of the secret string.
    pub fn sign(&self, secret: &str, base_string: &str) -> String {
        let digest = match self {
            SignatureMethod::HmacSha1 => {
                let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
                    .expect("HMAC can take key of any size");
                mac.update(base_string.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            SignatureMethod::HmacSha256 => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC can take key of any size");
                mac.update(base_string.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };
        BASE64.encode(digest)
    }
}

/// Percent-encode a string, preserving RFC 3986 unreserved characters
/// (`A-Z a-z 0-9 - _ . ~`). This is the encoding Amazon's quoting rules
/// expect for SigV2 canonical parameters.
pub fn uri_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Percent-decode a URI component (e.g. `%2F` → `/`).
pub fn percent_decode(input: &str) -> String {
    let mut result = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                result.push(byte);
                i += 3;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Lowercase the host and strip the default port for the scheme
/// (`:80` under http, `:443` under https). Other ports are retained.
pub fn normalize_host(scheme: &str, host: &str) -> String {
    let host = host.to_lowercase();
    let strip = (scheme == "http" && host.ends_with(":80"))
        || (scheme == "https" && host.ends_with(":443"));
    if strip {
        match host.rfind(':') {
            Some(idx) => host[..idx].to_string(),
            None => host,
        }
    } else {
        host
    }
}

/// Sorted, percent-encoded query string for signing. `Signature` is never
/// part of the string it is compared against. Repeated keys emit one `k=v`
/// per value, ordered by key then value.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .filter(|(k, _)| k != "Signature")
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// The four-line canonical base string.
pub fn base_string(
    method: &str,
    scheme: &str,
    host: &str,
    path: &str,
    params: &[(String, String)],
) -> String {
    let path = if path.is_empty() { "/" } else { path };
    format!(
        "{}\n{}\n{}\n{}",
        method,
        normalize_host(scheme, host),
        path,
        canonical_query(params)
    )
}

/// Current UTC time in the SigV2 wire format.
pub fn generate_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a `Timestamp`/`Expires` parameter. Values are UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, GatewayError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| GatewayError::Unauthenticated("bad timestamp".to_string()))
}

/// Enforce the timestamp acceptance window: a timestamp must not be in the
/// future and must not be older than `max_age_secs`. When `expires` is
/// present the request is additionally rejected once that instant passes.
pub fn check_timestamp_window(
    timestamp: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age_secs: u64,
) -> Result<(), GatewayError> {
    if let Some(expires) = expires {
        if expires < now {
            return Err(GatewayError::Unauthenticated(
                "request has expired".to_string(),
            ));
        }
    }
    if timestamp > now {
        return Err(GatewayError::Unauthenticated("bad timestamp".to_string()));
    }
    if timestamp < now - Duration::seconds(max_age_secs as i64) {
        return Err(GatewayError::Unauthenticated("bad timestamp".to_string()));
    }
    Ok(())
}

/// Verifies inbound request signatures against a credential store and, on
/// success, names the entity that signed the request.
pub struct Verifier {
    credentials: Arc<CredentialStore>,
    max_signature_age: u64,
}

impl Verifier {
    pub fn new(credentials: Arc<CredentialStore>, max_signature_age: u64) -> Self {
        Self {
            credentials,
            max_signature_age,
        }
    }

    /// Authenticate the request, returning the signing entity.
    pub fn authenticate(
        &self,
        request: &crate::types::GatewayRequest,
    ) -> Result<String, GatewayError> {
        self.authenticate_at(request, Utc::now())
    }

    fn authenticate_at(
        &self,
        request: &crate::types::GatewayRequest,
        now: DateTime<Utc>,
    ) -> Result<String, GatewayError> {
        if REQUIRED_PARAMS.iter().any(|p| request.param(p).is_none()) {
            return Err(GatewayError::Unauthenticated(
                "missing required signature parameters".to_string(),
            ));
        }
        // The presence checks above make these lookups infallible.
        let access_key = request.param("AWSAccessKeyId").unwrap_or_default();
        let provided = request.param("Signature").unwrap_or_default();
        let method = SignatureMethod::resolve(
            request.param("SignatureMethod").unwrap_or_default(),
            request.param("SignatureVersion").unwrap_or_default(),
        )?;

        let timestamp = parse_timestamp(request.param("Timestamp").unwrap_or_default())?;
        let expires = request.param("Expires").map(parse_timestamp).transpose()?;
        check_timestamp_window(timestamp, expires, now, self.max_signature_age)?;

        let credential = self.credentials.for_key(access_key).ok_or_else(|| {
            GatewayError::Unauthenticated("unknown access key".to_string())
        })?;

        let base = base_string(
            &request.method,
            &request.scheme,
            &request.host,
            &request.path,
            &request.params,
        );
        let expected = method.sign(&credential.secret, &base);

        if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
            debug!(access_key = %access_key, entity = %credential.entity, "signature verified");
            Ok(credential.entity.clone())
        } else {
            debug!(access_key = %access_key, "signature mismatch");
            Err(GatewayError::Unauthenticated(
                "signature mismatch".to_string(),
            ))
        }
    }
}
