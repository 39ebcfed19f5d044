//! Configuration loading for the gateway
//!
//! Three inputs are consumed at startup, all fatal on error:
//!
//! - gateway settings (listen address, inbound scheme, upstream deadline)
//!   from `GOLDENGATE_*` environment variables with CLI overrides;
//! - the ruleset stream: a multi-document YAML file where each document maps
//!   stage names to lists of rule lines;
//! - an optional policy file: a YAML list of policy entries compiled into
//!   the authorization layer.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stage names a ruleset document may contain.
pub const STAGE_NAMES: [&str; 6] = [
    "match",
    "filter",
    "modify_request",
    "modify_response",
    "audit_request",
    "audit_response",
];

/// Configuration errors. All of these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to find a goldengate config file, giving up")]
    NotFound,

    #[error("IO error: {0}")]
    Io(String),

    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("ruleset document {index}: unknown stage {stage:?}")]
    UnknownStage { index: usize, stage: String },

    #[error("ruleset document {index}: missing required {stage:?} stage")]
    MissingStage { index: usize, stage: &'static str },

    #[error("invalid rule {line:?}: {reason}")]
    Rule { line: String, reason: String },

    #[error("credential error: {0}")]
    Credentials(String),

    #[error("invalid policy configuration: {0}")]
    Policy(String),
}

impl ConfigError {
    /// Helper for rule compilation failures.
    pub fn rule(line: &str, reason: impl Into<String>) -> Self {
        ConfigError::Rule {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// Process-level gateway settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the proxy listens on.
    pub listen_addr: SocketAddr,
    /// Scheme clients use to reach the gateway (`http` or `https`). Feeds
    /// request canonicalization; TLS termination itself lives in front of
    /// the gateway.
    pub scheme: String,
    /// Deadline for a single upstream exchange, in seconds.
    pub upstream_timeout_secs: u64,
    /// Optional policy file path.
    pub policies: Option<PathBuf>,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8000".parse().expect("static default address")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            scheme: "http".to_string(),
            upstream_timeout_secs: 30,
            policies: None,
        }
    }
}

impl Settings {
    /// Load settings from `GOLDENGATE_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(addr) = std::env::var("GOLDENGATE_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                settings.listen_addr = parsed;
            }
        }
        if let Ok(scheme) = std::env::var("GOLDENGATE_SCHEME") {
            if scheme == "http" || scheme == "https" {
                settings.scheme = scheme;
            }
        }
        if let Ok(timeout) = std::env::var("GOLDENGATE_UPSTREAM_TIMEOUT_SECS") {
            if let Ok(parsed) = timeout.parse() {
                settings.upstream_timeout_secs = parsed;
            }
        }
        if let Ok(path) = std::env::var("GOLDENGATE_POLICIES") {
            settings.policies = Some(PathBuf::from(path));
        }

        settings
    }

    /// Address of the control listener (cancellation links, health,
    /// metrics): the proxy port plus one, on the same interface.
    pub fn control_addr(&self) -> SocketAddr {
        let mut addr = self.listen_addr;
        addr.set_port(addr.port().wrapping_add(1));
        addr
    }
}

/// One parsed ruleset document: stage name → rule lines, exactly as written.
pub type RawRuleset = BTreeMap<String, Vec<String>>;

/// Locate the ruleset file. Lookup order: explicit argument,
/// `$GOLDENGATE_CONFIG`, `$PWD/goldengate.conf`,
/// `$HOME/.goldengate/goldengate.conf`, `/etc/goldengate/goldengate.conf`.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(path) = std::env::var("GOLDENGATE_CONFIG") {
        candidates.push(PathBuf::from(path));
    }
    if let Ok(pwd) = std::env::current_dir() {
        candidates.push(pwd.join("goldengate.conf"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".goldengate/goldengate.conf"));
    }
    candidates.push(PathBuf::from("/etc/goldengate/goldengate.conf"));

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or(ConfigError::NotFound)
}

/// Parse the multi-document YAML ruleset stream. Documents must only use
/// known stage names and must carry at least a `match` and a `filter` stage.
pub fn load_rulesets(path: &Path) -> Result<Vec<RawRuleset>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    parse_rulesets(&text)
}

/// [`load_rulesets`] over an in-memory string.
pub fn parse_rulesets(text: &str) -> Result<Vec<RawRuleset>, ConfigError> {
    let mut rulesets = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value =
            serde_yaml::Value::deserialize(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        let ruleset: RawRuleset =
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let index = rulesets.len();

        for stage in ruleset.keys() {
            if !STAGE_NAMES.contains(&stage.as_str()) {
                return Err(ConfigError::UnknownStage {
                    index,
                    stage: stage.clone(),
                });
            }
        }
        for required in ["match", "filter"] {
            if !ruleset.contains_key(required) {
                return Err(ConfigError::MissingStage {
                    index,
                    stage: required,
                });
            }
        }
        rulesets.push(ruleset);
    }
    Ok(rulesets)
}

/// How a matched policy decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyEffect {
    Allow,
    Deny,
    TimeLock,
}

/// Matcher half of a policy entry. Omitted fields widen the match; an empty
/// spec matches every request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyMatchSpec {
    /// Match requests whose `Action` query parameter equals this value.
    #[serde(default)]
    pub action: Option<String>,
    /// Match requests made by one of these entities.
    #[serde(default)]
    pub entities: Option<Vec<String>>,
}

/// One entry of the policy file, in evaluation order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    #[serde(default, rename = "match")]
    pub matcher: PolicyMatchSpec,
    pub effect: PolicyEffect,
    /// Time-lock duration. Required when effect is `time-lock`.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Notification recipients for time-locked requests.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Inline notification template.
    #[serde(default)]
    pub template: Option<String>,
    /// Notification template loaded from a file. Mutually exclusive with
    /// `template`.
    #[serde(default)]
    pub template_file: Option<PathBuf>,
}

/// Load the policy file: a single YAML document holding a list of entries.
pub fn load_policies(path: &Path) -> Result<Vec<PolicySpec>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let specs: Vec<PolicySpec> =
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Policy(e.to_string()))?;
    for spec in &specs {
        if spec.effect == PolicyEffect::TimeLock && spec.duration_secs.is_none() {
            return Err(ConfigError::Policy(
                "time-lock policies require duration_secs".to_string(),
            ));
        }
        if spec.template.is_some() && spec.template_file.is_some() {
            return Err(ConfigError::Policy(
                "template and template_file are mutually exclusive".to_string(),
            ));
        }
    }
    Ok(specs)
}
