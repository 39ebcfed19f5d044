//! Modify rules: overlay, attribute and header transformations
//!
//! Verb grammar:
//!
//! ```text
//! url set <value>
//! method set <value>
//! <attribute> set <value...>      attribute ∈ {content_type, charset,
//!                                              host, body, cache_control}
//! header set <key> <value...>
//! header remove <key>
//! ```
//!
//! `url set` and `method set` never touch the real URL or method: they write
//! the override slots the proxy client reads with override > original
//! precedence. Header values support `$name` templates resolved against
//! request attributes first, then the process environment.

use super::{HttpMessage, RuleLine, RuleRegistry, TransformRule};
use crate::config::ConfigError;
use crate::error::GatewayError;
use axum::http::header::{HeaderName, HeaderValue};
use bytes::Bytes;
use regex::Regex;

pub(super) fn register(registry: &mut RuleRegistry) {
    registry.register_modify("url", |line| {
        let value = set_value(line)?;
        Ok(Box::new(OverlayRule {
            slot: OverlaySlot::Url,
            value,
        }))
    });
    registry.register_modify("method", |line| {
        let value = set_value(line)?;
        Ok(Box::new(OverlayRule {
            slot: OverlaySlot::Method,
            value,
        }))
    });
    for attribute in ["content_type", "charset", "host", "body", "cache_control"] {
        registry.register_modify(attribute, move |line| {
            let value = set_value_joined(line)?;
            Ok(Box::new(AttributeSet {
                attribute,
                value,
            }))
        });
    }
    registry.register_modify("header", |line| header_rule(line));
}

/// `<verb> set <value>` — exactly one value.
fn set_value(line: &RuleLine) -> Result<String, ConfigError> {
    match line.args.first().map(String::as_str) {
        Some("set") => {}
        other => {
            return Err(ConfigError::rule(
                &line.raw,
                format!("only \"set\" is supported, got {:?}", other.unwrap_or("")),
            ))
        }
    }
    line.args
        .get(1)
        .cloned()
        .ok_or_else(|| ConfigError::rule(&line.raw, "set needs a value"))
}

/// `<verb> set <value...>` — the tail is joined with single spaces.
fn set_value_joined(line: &RuleLine) -> Result<String, ConfigError> {
    match line.args.first().map(String::as_str) {
        Some("set") => {}
        other => {
            return Err(ConfigError::rule(
                &line.raw,
                format!("only \"set\" is supported, got {:?}", other.unwrap_or("")),
            ))
        }
    }
    if line.args.len() < 2 {
        return Err(ConfigError::rule(&line.raw, "set needs a value"));
    }
    Ok(line.args[1..].join(" "))
}

enum OverlaySlot {
    Url,
    Method,
}

/// Writes the proxy target overlay without mutating the request proper.
struct OverlayRule {
    slot: OverlaySlot,
    value: String,
}

impl TransformRule for OverlayRule {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError> {
        match self.slot {
            OverlaySlot::Url => {
                message.request_mut("url")?.override_url = Some(self.value.clone());
            }
            OverlaySlot::Method => {
                message.request_mut("method")?.override_method = Some(self.value.clone());
            }
        }
        Ok(())
    }
}

/// Sets a named attribute of the message.
struct AttributeSet {
    attribute: &'static str,
    value: String,
}

impl TransformRule for AttributeSet {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError> {
        match self.attribute {
            "content_type" => set_header(message, "content-type", &self.value)?,
            "cache_control" => set_header(message, "cache-control", &self.value)?,
            "charset" => {
                let current = message
                    .headers_mut()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
                    .ok_or_else(|| {
                        GatewayError::RuleExecution(
                            "charset set requires an existing content type".to_string(),
                        )
                    })?;
                set_header(
                    message,
                    "content-type",
                    &format!("{}; charset={}", current, self.value),
                )?;
            }
            "host" => {
                let request = message.request_mut("host")?;
                request.host = self.value.clone();
                let value = HeaderValue::from_str(&self.value).map_err(|_| {
                    GatewayError::RuleExecution(format!("invalid host value {:?}", self.value))
                })?;
                request.headers.insert(axum::http::header::HOST, value);
            }
            "body" => message.set_body(Bytes::from(self.value.clone().into_bytes())),
            other => {
                return Err(GatewayError::RuleExecution(format!(
                    "unsupported attribute {other:?}"
                )))
            }
        }
        Ok(())
    }
}

fn set_header(message: &mut HttpMessage, name: &str, value: &str) -> Result<(), GatewayError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| GatewayError::RuleExecution(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| GatewayError::RuleExecution(format!("invalid header value {value:?}")))?;
    message.headers_mut().insert(name, value);
    Ok(())
}

fn header_rule(line: &RuleLine) -> Result<Box<dyn TransformRule>, ConfigError> {
    let action = line
        .args
        .first()
        .ok_or_else(|| ConfigError::rule(&line.raw, "header rules need an action"))?;
    let key = line
        .args
        .get(1)
        .ok_or_else(|| ConfigError::rule(&line.raw, "header rules need a key"))?
        .clone();
    HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| ConfigError::rule(&line.raw, format!("invalid header name {key:?}")))?;

    match action.as_str() {
        "set" => {
            if line.args.len() < 3 {
                return Err(ConfigError::rule(&line.raw, "header set needs a value"));
            }
            Ok(Box::new(HeaderSet {
                key,
                template: line.args[2..].join(" "),
                variables: Regex::new(r"\$([a-z_]+)").expect("static pattern"),
            }))
        }
        "remove" => Ok(Box::new(HeaderRemove { key })),
        other => Err(ConfigError::rule(
            &line.raw,
            format!("unknown header action {other:?}"),
        )),
    }
}

/// `header set <key> <value...>` with `$name` template expansion.
struct HeaderSet {
    key: String,
    template: String,
    variables: Regex,
}

impl HeaderSet {
    fn expand(&self, message: &HttpMessage) -> Result<String, GatewayError> {
        let mut expanded = String::with_capacity(self.template.len());
        let mut last = 0;
        for captures in self.variables.captures_iter(&self.template) {
            let whole = captures.get(0).expect("capture 0 always present");
            let name = &captures[1];
            let replacement = message
                .attribute(name)
                .or_else(|| std::env::var(name).ok())
                .ok_or_else(|| {
                    GatewayError::RuleExecution(format!(
                        "unable to replace template variable ${name}: unknown request attribute"
                    ))
                })?;
            expanded.push_str(&self.template[last..whole.start()]);
            expanded.push_str(&replacement);
            last = whole.end();
        }
        expanded.push_str(&self.template[last..]);
        Ok(expanded)
    }
}

impl TransformRule for HeaderSet {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError> {
        let value = self.expand(message)?;
        set_header(message, &self.key, &value)
    }
}

/// `header remove <key>` — removing an absent header is a no-op.
struct HeaderRemove {
    key: String,
}

impl TransformRule for HeaderRemove {
    fn apply(&self, message: &mut HttpMessage) -> Result<(), GatewayError> {
        message.headers_mut().remove(self.key.as_str());
        Ok(())
    }
}
