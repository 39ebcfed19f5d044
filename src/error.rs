//! Request-level error types
//!
//! Startup failures use [`crate::config::ConfigError`] and abort the process.
//! Everything that can go wrong while a request is in flight is a
//! [`GatewayError`]; the pipeline catches it at its outer boundary and turns
//! it into a status-coded response, so no error ever propagates past the
//! pipeline.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised while processing a single request.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Signature validation failed. Surfaces as a filter denial (403).
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// No configured policy applies to the (entity, request) pair.
    #[error("no policy applies to this request")]
    NoApplicablePolicy,

    /// A compiled rule failed at execution time (unresolvable template
    /// variable, value not representable as a header, rule applied to the
    /// wrong kind of message).
    #[error("rule execution failed: {0}")]
    RuleExecution(String),

    /// The upstream request could not be completed.
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl GatewayError {
    /// HTTP status the pipeline responds with when this error reaches its
    /// outer boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::FORBIDDEN,
            GatewayError::NoApplicablePolicy => StatusCode::FORBIDDEN,
            GatewayError::RuleExecution(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Unauthenticated("bad timestamp".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NoApplicablePolicy.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RuleExecution("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Upstream("connect refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
