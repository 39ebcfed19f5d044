//! Rule library and compiler
//!
//! Rules are single-line strings compiled at startup into trait objects.
//! Three shapes exist, keyed by stage category:
//!
//! - **match** rules are pure predicates over the request;
//! - **filter** rules decide permit-or-reject (and may authenticate,
//!   recording the entity on the request);
//! - **modify** rules transform a request or response in place. Audit stages
//!   reuse the modify registry; their results are discarded.
//!
//! Verbs resolve through [`RuleRegistry`], a map from (category, verb) to a
//! constructor closure, so every verb in the config is validated before the
//! gateway accepts traffic.

mod aws;
mod engine;
mod predicates;
mod transforms;

pub use engine::{compile_all, CompiledRuleset};

use crate::config::ConfigError;
use crate::error::GatewayError;
use crate::types::{GatewayRequest, GatewayResponse};
use axum::http::HeaderMap;
use bytes::Bytes;
use std::collections::HashMap;

/// The six pipeline stages a ruleset document may populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Filter,
    ModifyRequest,
    ModifyResponse,
    AuditRequest,
    AuditResponse,
}

impl StageKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "match" => Some(StageKind::Match),
            "filter" => Some(StageKind::Filter),
            "modify_request" => Some(StageKind::ModifyRequest),
            "modify_response" => Some(StageKind::ModifyResponse),
            "audit_request" => Some(StageKind::AuditRequest),
            "audit_response" => Some(StageKind::AuditResponse),
            _ => None,
        }
    }

    /// Registry category for this stage. Both modify stages share one verb
    /// table and the audit stages reuse it.
    pub fn category(&self) -> RuleCategory {
        match self {
            StageKind::Match => RuleCategory::Match,
            StageKind::Filter => RuleCategory::Filter,
            StageKind::ModifyRequest
            | StageKind::ModifyResponse
            | StageKind::AuditRequest
            | StageKind::AuditResponse => RuleCategory::Modify,
        }
    }
}

/// Verb lookup category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    Match,
    Filter,
    Modify,
}

/// Leading token of a filter rule line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Permit,
    Reject,
}

/// A request or response flowing through modify/audit stages.
#[derive(Debug, Clone)]
pub enum HttpMessage {
    Request(GatewayRequest),
    Response(GatewayResponse),
}

impl HttpMessage {
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            HttpMessage::Request(r) => &mut r.headers,
            HttpMessage::Response(r) => &mut r.headers,
        }
    }

    pub fn set_body(&mut self, body: Bytes) {
        match self {
            HttpMessage::Request(r) => r.body = body,
            HttpMessage::Response(r) => r.body = body,
        }
    }

    /// Request-only rules call this; applying them to a response is a rule
    /// execution error (500), not a panic.
    pub fn request_mut(&mut self, verb: &str) -> Result<&mut GatewayRequest, GatewayError> {
        match self {
            HttpMessage::Request(r) => Ok(r),
            HttpMessage::Response(_) => Err(GatewayError::RuleExecution(format!(
                "{verb} rule applied to a response"
            ))),
        }
    }

    /// Attribute resolver used by `$name` header templates. Responses have
    /// no request attributes.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match self {
            HttpMessage::Request(r) => r.attribute(name),
            HttpMessage::Response(_) => None,
        }
    }
}

/// Pure predicate over the request.
pub trait MatchRule: std::fmt::Debug + Send + Sync {
    fn eval(&self, request: &GatewayRequest) -> bool;
}

/// Permit-or-reject predicate. Takes the request mutably so authenticating
/// filters can record the entity.
pub trait FilterRule: Send + Sync {
    fn permit(&self, request: &mut GatewayRequest) -> Result<bool, GatewayError>;
}

/// In-place transformation of a request or response.
pub trait TransformRule: Send + Sync {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError>;
}

/// Adapts any match predicate into a filter rule.
struct PredicateFilter(Box<dyn MatchRule>);

impl FilterRule for PredicateFilter {
    fn permit(&self, request: &mut GatewayRequest) -> Result<bool, GatewayError> {
        Ok(self.0.eval(request))
    }
}

/// One parsed rule line, before verb resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLine {
    /// The line as written, for error reporting.
    pub raw: String,
    /// `permit`/`reject`, present only in filter stages.
    pub action: Option<FilterAction>,
    pub verb: String,
    /// Positional tokens after the verb.
    pub args: Vec<String>,
    /// `key=value` tokens, split on the first `=`.
    pub kwargs: HashMap<String, String>,
}

impl RuleLine {
    /// Split a rule line into verb, positional arguments and key=value
    /// pairs. `\ ` (backslash-space) escapes a literal space inside a token.
    pub fn parse(line: &str, stage: StageKind) -> Result<Self, ConfigError> {
        let tokens = tokenize(line);

        let mut positional: Vec<String> = Vec::new();
        let mut kwargs = HashMap::new();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) => {
                    kwargs.insert(key.to_string(), value.to_string());
                }
                None => positional.push(token),
            }
        }

        let mut positional = positional.into_iter();
        let action = if stage.category() == RuleCategory::Filter {
            match positional.next().as_deref() {
                Some("permit") => Some(FilterAction::Permit),
                Some("reject") => Some(FilterAction::Reject),
                other => {
                    return Err(ConfigError::rule(
                        line,
                        format!(
                            "filter rules start with permit or reject, got {:?}",
                            other.unwrap_or("")
                        ),
                    ))
                }
            }
        } else {
            None
        };

        let verb = positional
            .next()
            .ok_or_else(|| ConfigError::rule(line, "missing verb"))?;

        Ok(RuleLine {
            raw: line.to_string(),
            action,
            verb,
            args: positional.collect(),
            kwargs,
        })
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    pub fn require_kwarg(&self, key: &str) -> Result<&str, ConfigError> {
        self.kwarg(key)
            .ok_or_else(|| ConfigError::rule(&self.raw, format!("{key}= is required")))
    }
}

/// Split on single spaces, honouring the `\ ` escape. Empty tokens from
/// runs of spaces are dropped.
fn tokenize(line: &str) -> Vec<String> {
    line.replace("\\ ", "\u{0}")
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| t.replace('\u{0}', " "))
        .collect()
}

type MatchCtor = Box<dyn Fn(&RuleLine) -> Result<Box<dyn MatchRule>, ConfigError> + Send + Sync>;
type FilterCtor = Box<dyn Fn(&RuleLine) -> Result<Box<dyn FilterRule>, ConfigError> + Send + Sync>;
type TransformCtor =
    Box<dyn Fn(&RuleLine) -> Result<Box<dyn TransformRule>, ConfigError> + Send + Sync>;

/// Verb → constructor tables, one per category.
pub struct RuleRegistry {
    match_verbs: HashMap<&'static str, MatchCtor>,
    filter_verbs: HashMap<&'static str, FilterCtor>,
    modify_verbs: HashMap<&'static str, TransformCtor>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleRegistry {
    /// The built-in rule library.
    pub fn standard() -> Self {
        let mut registry = Self {
            match_verbs: HashMap::new(),
            filter_verbs: HashMap::new(),
            modify_verbs: HashMap::new(),
        };
        predicates::register(&mut registry);
        transforms::register(&mut registry);
        aws::register(&mut registry);
        registry
    }

    /// Register a predicate verb for both the match and filter categories.
    pub(crate) fn register_predicate<F>(&mut self, verb: &'static str, ctor: F)
    where
        F: Fn(&RuleLine) -> Result<Box<dyn MatchRule>, ConfigError>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let filter_ctor = ctor.clone();
        self.match_verbs.insert(verb, Box::new(ctor));
        self.filter_verbs.insert(
            verb,
            Box::new(move |line| Ok(Box::new(PredicateFilter(filter_ctor(line)?)))),
        );
    }

    /// Register a filter-only verb.
    pub(crate) fn register_filter<F>(&mut self, verb: &'static str, ctor: F)
    where
        F: Fn(&RuleLine) -> Result<Box<dyn FilterRule>, ConfigError> + Send + Sync + 'static,
    {
        self.filter_verbs.insert(verb, Box::new(ctor));
    }

    /// Register a modify verb (shared with the audit stages).
    pub(crate) fn register_modify<F>(&mut self, verb: &'static str, ctor: F)
    where
        F: Fn(&RuleLine) -> Result<Box<dyn TransformRule>, ConfigError> + Send + Sync + 'static,
    {
        self.modify_verbs.insert(verb, Box::new(ctor));
    }

    pub fn compile_match(&self, line: &RuleLine) -> Result<Box<dyn MatchRule>, ConfigError> {
        let ctor = self
            .match_verbs
            .get(line.verb.as_str())
            .ok_or_else(|| ConfigError::rule(&line.raw, format!("unknown verb {:?}", line.verb)))?;
        ctor(line)
    }

    pub fn compile_filter(&self, line: &RuleLine) -> Result<Box<dyn FilterRule>, ConfigError> {
        let ctor = self
            .filter_verbs
            .get(line.verb.as_str())
            .ok_or_else(|| ConfigError::rule(&line.raw, format!("unknown verb {:?}", line.verb)))?;
        ctor(line)
    }

    pub fn compile_modify(&self, line: &RuleLine) -> Result<Box<dyn TransformRule>, ConfigError> {
        let ctor = self
            .modify_verbs
            .get(line.verb.as_str())
            .ok_or_else(|| ConfigError::rule(&line.raw, format!("unknown verb {:?}", line.verb)))?;
        ctor(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_match_line() {
        let line = RuleLine::parse("path regex ^/foo", StageKind::Match).unwrap();
        assert_eq!(line.verb, "path");
        assert_eq!(line.args, vec!["regex", "^/foo"]);
        assert!(line.action.is_none());
        assert!(line.kwargs.is_empty());
    }

    #[test]
    fn test_parse_filter_line_with_kwargs() {
        let line = RuleLine::parse(
            "permit aws_signature creds=aws.creds max_signature_age=600",
            StageKind::Filter,
        )
        .unwrap();
        assert_eq!(line.action, Some(FilterAction::Permit));
        assert_eq!(line.verb, "aws_signature");
        assert!(line.args.is_empty());
        assert_eq!(line.kwarg("creds"), Some("aws.creds"));
        assert_eq!(line.kwarg("max_signature_age"), Some("600"));
    }

    #[test]
    fn test_parse_reject_line() {
        let line = RuleLine::parse("reject header User-Agent regex ^curl", StageKind::Filter)
            .unwrap();
        assert_eq!(line.action, Some(FilterAction::Reject));
        assert_eq!(line.verb, "header");
        assert_eq!(line.args, vec!["User-Agent", "regex", "^curl"]);
    }

    #[test]
    fn test_escaped_space_stays_in_token() {
        let line = RuleLine::parse(r"header set X-Note hello\ world", StageKind::ModifyRequest)
            .unwrap();
        assert_eq!(line.args, vec!["set", "X-Note", "hello world"]);
    }

    #[test]
    fn test_kwarg_splits_on_first_equals() {
        let line = RuleLine::parse("url set x creds=a=b", StageKind::ModifyRequest).unwrap();
        assert_eq!(line.kwarg("creds"), Some("a=b"));
    }

    #[test]
    fn test_filter_line_requires_action() {
        assert!(RuleLine::parse("all", StageKind::Filter).is_err());
        assert!(RuleLine::parse("allow all", StageKind::Filter).is_err());
    }

    #[test]
    fn test_empty_line_is_error() {
        assert!(RuleLine::parse("", StageKind::Match).is_err());
        assert!(RuleLine::parse("   ", StageKind::Match).is_err());
    }

    #[test]
    fn test_audit_stages_share_modify_category() {
        assert_eq!(StageKind::AuditRequest.category(), RuleCategory::Modify);
        assert_eq!(StageKind::AuditResponse.category(), RuleCategory::Modify);
        assert_eq!(StageKind::ModifyResponse.category(), RuleCategory::Modify);
    }

    #[test]
    fn test_unknown_verb_is_config_error() {
        let registry = RuleRegistry::standard();
        let line = RuleLine::parse("frobnicate everything", StageKind::Match).unwrap();
        assert!(registry.compile_match(&line).is_err());
    }

    proptest! {
        // Tokens never contain raw spaces after parsing, no matter how the
        // line mixes escapes and separators.
        #[test]
        fn prop_tokenizer_round_trips_escaped_tokens(
            tokens in proptest::collection::vec("[a-z]{1,8}( [a-z]{1,8})?", 1..5)
        ) {
            let line = tokens
                .iter()
                .map(|t| t.replace(' ', "\\ "))
                .collect::<Vec<_>>()
                .join(" ");
            prop_assert_eq!(tokenize(&line), tokens);
        }
    }
}
