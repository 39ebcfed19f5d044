//! Predicate rules shared by the match and filter stages
//!
//! Verb grammar:
//!
//! ```text
//! all
//! none
//! <attribute> <matchtype> <param...>
//! header <name> <matchtype> <param...>
//! ```
//!
//! with `matchtype` one of `is`, `in`, `regex`, `subnet`. All parameters are
//! validated at compile time; evaluation cannot fail.

use super::{MatchRule, RuleLine, RuleRegistry};
use crate::config::ConfigError;
use crate::types::GatewayRequest;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;

/// Request attributes addressable by predicate verbs.
pub const ATTRIBUTES: [&str; 14] = [
    "method",
    "scheme",
    "script_name",
    "path_info",
    "remote_user",
    "remote_addr",
    "host",
    "host_url",
    "application_url",
    "path_url",
    "url",
    "path",
    "path_qs",
    "query_string",
];

pub(super) fn register(registry: &mut RuleRegistry) {
    registry.register_predicate("all", |_line| Ok(Box::new(AllRule)));
    registry.register_predicate("none", |_line| Ok(Box::new(NoneRule)));
    for attribute in ATTRIBUTES {
        registry.register_predicate(attribute, move |line| {
            let matcher = ValueMatcher::compile(line, &line.args)?;
            Ok(Box::new(AttributeMatch {
                attribute: attribute.to_string(),
                matcher,
            }))
        });
    }
    registry.register_predicate("header", |line| {
        let name = line
            .args
            .first()
            .ok_or_else(|| ConfigError::rule(&line.raw, "header rules need a header name"))?
            .clone();
        let matcher = ValueMatcher::compile(line, &line.args[1..])?;
        Ok(Box::new(HeaderMatch { name, matcher }))
    });
}

/// Matches every request.
#[derive(Debug)]
struct AllRule;

impl MatchRule for AllRule {
    fn eval(&self, _request: &GatewayRequest) -> bool {
        true
    }
}

/// Matches no request.
#[derive(Debug)]
struct NoneRule;

impl MatchRule for NoneRule {
    fn eval(&self, _request: &GatewayRequest) -> bool {
        false
    }
}

/// Compiled `<matchtype> <param...>` tail of a predicate rule.
#[derive(Debug)]
enum ValueMatcher {
    Is(String),
    In(Vec<String>),
    Regex(Regex),
    Subnet(Vec<IpNet>),
}

impl ValueMatcher {
    /// `args` is the rule tail starting at the matchtype token.
    fn compile(line: &RuleLine, args: &[String]) -> Result<Self, ConfigError> {
        let matchtype = args
            .first()
            .ok_or_else(|| ConfigError::rule(&line.raw, "missing matchtype"))?;
        let params = &args[1..];

        match matchtype.as_str() {
            "is" => {
                let expected = params
                    .first()
                    .ok_or_else(|| ConfigError::rule(&line.raw, "is needs a value"))?;
                Ok(ValueMatcher::Is(expected.clone()))
            }
            "in" => Ok(ValueMatcher::In(params.to_vec())),
            "regex" => {
                let pattern = params
                    .first()
                    .ok_or_else(|| ConfigError::rule(&line.raw, "regex needs a pattern"))?;
                // Anchor at the start of the value; the pattern itself
                // decides how far it reaches.
                let anchored = format!(r"\A(?:{pattern})");
                let regex = Regex::new(&anchored)
                    .map_err(|e| ConfigError::rule(&line.raw, format!("bad regex: {e}")))?;
                Ok(ValueMatcher::Regex(regex))
            }
            "subnet" => {
                if params.is_empty() {
                    return Err(ConfigError::rule(&line.raw, "subnet needs CIDR blocks"));
                }
                let mut nets = Vec::with_capacity(params.len());
                for param in params {
                    let net = param
                        .parse::<IpNet>()
                        .or_else(|_| param.parse::<IpAddr>().map(IpNet::from))
                        .map_err(|_| {
                            ConfigError::rule(&line.raw, format!("bad CIDR block {param:?}"))
                        })?;
                    nets.push(net);
                }
                Ok(ValueMatcher::Subnet(nets))
            }
            other => Err(ConfigError::rule(
                &line.raw,
                format!("unknown matchtype {other:?}"),
            )),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            ValueMatcher::Is(expected) => value == expected,
            ValueMatcher::In(options) => options.iter().any(|o| o == value),
            ValueMatcher::Regex(regex) => regex.is_match(value),
            ValueMatcher::Subnet(nets) => match value.parse::<IpAddr>() {
                Ok(addr) => nets.iter().any(|net| net.contains(&addr)),
                Err(_) => false,
            },
        }
    }
}

/// `<attribute> <matchtype> <param...>` — absent attributes never match.
#[derive(Debug)]
struct AttributeMatch {
    attribute: String,
    matcher: ValueMatcher,
}

impl MatchRule for AttributeMatch {
    fn eval(&self, request: &GatewayRequest) -> bool {
        match request.attribute(&self.attribute) {
            Some(value) => self.matcher.matches(&value),
            None => false,
        }
    }
}

/// `header <name> <matchtype> <param...>` — absent headers never match.
#[derive(Debug)]
struct HeaderMatch {
    name: String,
    matcher: ValueMatcher,
}

impl MatchRule for HeaderMatch {
    fn eval(&self, request: &GatewayRequest) -> bool {
        request
            .headers
            .get(self.name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|value| self.matcher.matches(value))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StageKind;

    fn compile(line: &str) -> Box<dyn MatchRule> {
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(line, StageKind::Match).unwrap();
        registry.compile_match(&parsed).unwrap()
    }

    fn compile_err(line: &str) -> ConfigError {
        let registry = RuleRegistry::standard();
        let parsed = RuleLine::parse(line, StageKind::Match).unwrap();
        registry.compile_match(&parsed).unwrap_err()
    }

    fn request() -> GatewayRequest {
        let mut req = GatewayRequest {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "goldengate.example.com".to_string(),
            path: "/foo/bar".to_string(),
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        req.headers.insert(
            "User-Agent",
            "curl/7.19.7 (universal-apple-darwin10.0)".parse().unwrap(),
        );
        req.headers
            .insert("Accept", "*/*".parse().unwrap());
        req
    }

    #[test]
    fn test_all_and_none() {
        assert!(compile("all").eval(&request()));
        assert!(!compile("none").eval(&request()));
    }

    #[test]
    fn test_path_regex() {
        assert!(compile("path regex ^/foo").eval(&request()));
        assert!(!compile("path regex ^/bar").eval(&request()));
    }

    #[test]
    fn test_regex_anchors_at_start() {
        // Would match mid-string with an unanchored search.
        assert!(!compile("path regex bar").eval(&request()));
        assert!(compile("path regex /foo/bar").eval(&request()));
    }

    #[test]
    fn test_method_is() {
        assert!(compile("method is GET").eval(&request()));
        assert!(!compile("method is POST").eval(&request()));
    }

    #[test]
    fn test_scheme_in() {
        assert!(compile("scheme in http https").eval(&request()));
        assert!(!compile("scheme in ftp gopher").eval(&request()));
    }

    #[test]
    fn test_remote_addr_subnet() {
        assert!(compile("remote_addr subnet 127.0.0.0/8").eval(&request()));
        assert!(!compile("remote_addr subnet 10.0.0.0/8").eval(&request()));
        assert!(compile("remote_addr subnet 10.0.0.0/8 127.0.0.0/8").eval(&request()));
        // A bare address counts as a host network.
        assert!(compile("remote_addr subnet 127.0.0.1").eval(&request()));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        assert!(!compile("remote_user is anyone").eval(&request()));
        assert!(!compile("remote_user regex .*").eval(&request()));
    }

    #[test]
    fn test_header_regex() {
        assert!(compile("header User-Agent regex ^curl").eval(&request()));
        assert!(!compile("header User-Agent regex ^wget").eval(&request()));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        assert!(compile("header user-agent regex ^curl").eval(&request()));
    }

    #[test]
    fn test_header_is_and_in() {
        // The host lives on the request struct, not in a Host header here.
        assert!(!compile("header Host is goldengate.example.com").eval(&request()));
        assert!(compile("header Accept in */* text/plain").eval(&request()));
    }

    #[test]
    fn test_absent_header_never_matches() {
        assert!(!compile("header X-Missing regex .*").eval(&request()));
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(compile_err("path sounds-like foo"), ConfigError::Rule { .. }));
        assert!(matches!(compile_err("path is"), ConfigError::Rule { .. }));
        assert!(matches!(compile_err("path regex ["), ConfigError::Rule { .. }));
        assert!(matches!(
            compile_err("remote_addr subnet not-a-net"),
            ConfigError::Rule { .. }
        ));
    }
}
