//! Authorization policies and the time-lock coordinator
//!
//! A policy pairs a [`Matcher`] over (entity, request) with a grant
//! decision. The decision is either constant (allow/deny) or deferred: a
//! time-lock policy records a cancellable lock, notifies observers, sleeps
//! for the lock duration and only then commits. Resolution scans the
//! configured list in order and the first applicable policy decides.

use crate::config::{ConfigError, PolicyEffect, PolicySpec};
use crate::error::GatewayError;
use crate::notify::{render_template, Notification, NotificationBroker, DEFAULT_TEMPLATE};
use crate::timelock::TimeLockStore;
use crate::types::GatewayRequest;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Composable predicate over (entity, request).
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches everything.
    Always,
    /// Matches when the entity is one of the named principals.
    Entity(HashSet<String>),
    /// Matches when the request's `Action` parameter equals this value.
    /// Requests without an action never match.
    AwsAction(String),
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    pub fn matches(&self, entity: &str, request: &GatewayRequest) -> bool {
        match self {
            Matcher::Always => true,
            Matcher::Entity(entities) => entities.contains(entity),
            Matcher::AwsAction(action) => request.aws_action() == Some(action.as_str()),
            Matcher::All(children) => children.iter().all(|m| m.matches(entity, request)),
            Matcher::Any(children) => children.iter().any(|m| m.matches(entity, request)),
            Matcher::Not(child) => !child.matches(entity, request),
        }
    }
}

/// A matcher plus a grant decision.
#[async_trait]
pub trait Policy: Send + Sync {
    fn applies_to(&self, entity: &str, request: &GatewayRequest) -> bool;

    /// Should the entity be allowed to perform this request? May suspend
    /// (time-lock) but must never block unrelated requests.
    async fn grant(&self, entity: &str, request: &GatewayRequest) -> Result<bool, GatewayError>;
}

/// Grants every matching request.
pub struct AllowPolicy {
    matcher: Matcher,
}

impl AllowPolicy {
    pub fn new(matcher: Matcher) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl Policy for AllowPolicy {
    fn applies_to(&self, entity: &str, request: &GatewayRequest) -> bool {
        self.matcher.matches(entity, request)
    }

    async fn grant(&self, _entity: &str, _request: &GatewayRequest) -> Result<bool, GatewayError> {
        Ok(true)
    }
}

/// Denies every matching request.
pub struct DenyPolicy {
    matcher: Matcher,
}

impl DenyPolicy {
    pub fn new(matcher: Matcher) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl Policy for DenyPolicy {
    fn applies_to(&self, entity: &str, request: &GatewayRequest) -> bool {
        self.matcher.matches(entity, request)
    }

    async fn grant(&self, _entity: &str, _request: &GatewayRequest) -> Result<bool, GatewayError> {
        Ok(false)
    }
}

/// Queues matching requests behind a cancellable delay. Observers are
/// notified when the lock starts and may cancel it before it expires; an
/// uncancelled lock commits to a grant.
pub struct TimeLockPolicy {
    matcher: Matcher,
    duration: Duration,
    store: Arc<dyn TimeLockStore>,
    broker: Arc<dyn NotificationBroker>,
    template: String,
    recipients: Vec<String>,
}

impl TimeLockPolicy {
    pub fn new(
        matcher: Matcher,
        duration: Duration,
        store: Arc<dyn TimeLockStore>,
        broker: Arc<dyn NotificationBroker>,
        template: String,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            matcher,
            duration,
            store,
            broker,
            template,
            recipients,
        }
    }
}

#[async_trait]
impl Policy for TimeLockPolicy {
    fn applies_to(&self, entity: &str, request: &GatewayRequest) -> bool {
        self.matcher.matches(entity, request)
    }

    async fn grant(&self, entity: &str, request: &GatewayRequest) -> Result<bool, GatewayError> {
        let id = Uuid::new_v4();
        self.store
            .insert(id)
            .await
            .map_err(|e| GatewayError::RuleExecution(e.to_string()))?;

        let execution_time = Utc::now()
            + chrono::Duration::from_std(self.duration)
                .map_err(|e| GatewayError::RuleExecution(e.to_string()))?;
        let request_information = serde_json::to_string_pretty(&request.audit_snapshot())
            .map_err(|e| GatewayError::RuleExecution(e.to_string()))?;
        let message = render_template(
            &self.template,
            &[
                ("request_information", request_information),
                (
                    "request_execution_time",
                    execution_time
                        .format("%a, %d %b %Y %H:%M:%S +0000")
                        .to_string(),
                ),
                (
                    "time_lock_duration",
                    format!("{:.1}", self.duration.as_secs_f64() / 60.0),
                ),
                ("request_uuid", id.to_string()),
            ],
        );

        info!(
            %id,
            entity,
            duration_secs = self.duration.as_secs(),
            "time-locking request"
        );
        // Delivery is fire-and-forget: a broker outage must not decide the
        // grant either way.
        if let Err(e) = self
            .broker
            .send(Notification {
                recipients: self.recipients.clone(),
                message,
            })
            .await
        {
            warn!(%id, error = %e, "time-lock notification not delivered");
        }

        tokio::time::sleep(self.duration).await;

        let state = self
            .store
            .get(id)
            .await
            .map_err(|e| GatewayError::RuleExecution(e.to_string()))?
            .ok_or_else(|| {
                GatewayError::RuleExecution(format!("time lock {id} disappeared before expiry"))
            })?;
        if state.cancelled {
            info!(%id, entity, "time-locked request was cancelled");
        }
        Ok(!state.cancelled)
    }
}

/// The ordered policy list. Empty means authorization is disabled and every
/// filtered request proceeds.
pub struct PolicySet {
    policies: Vec<Arc<dyn Policy>>,
}

impl PolicySet {
    pub fn empty() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self { policies }
    }

    /// Compile policy file entries. Time-lock entries bind the shared store
    /// and broker; templates load here so a bad path fails at startup.
    pub fn from_specs(
        specs: &[PolicySpec],
        store: Arc<dyn TimeLockStore>,
        broker: Arc<dyn NotificationBroker>,
    ) -> Result<Self, ConfigError> {
        let mut policies: Vec<Arc<dyn Policy>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let matcher = build_matcher(spec);
            let policy: Arc<dyn Policy> = match spec.effect {
                PolicyEffect::Allow => Arc::new(AllowPolicy::new(matcher)),
                PolicyEffect::Deny => Arc::new(DenyPolicy::new(matcher)),
                PolicyEffect::TimeLock => {
                    let duration = Duration::from_secs(spec.duration_secs.ok_or_else(|| {
                        ConfigError::Policy("time-lock policies require duration_secs".to_string())
                    })?);
                    let template = match (&spec.template, &spec.template_file) {
                        (Some(inline), _) => inline.clone(),
                        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                            ConfigError::Policy(format!(
                                "unable to read template {}: {}",
                                path.display(),
                                e
                            ))
                        })?,
                        (None, None) => DEFAULT_TEMPLATE.to_string(),
                    };
                    Arc::new(TimeLockPolicy::new(
                        matcher,
                        duration,
                        store.clone(),
                        broker.clone(),
                        template,
                        spec.recipients.clone(),
                    ))
                }
            };
            policies.push(policy);
        }
        Ok(Self { policies })
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// First policy whose matcher accepts (entity, request).
    pub fn policy_for(
        &self,
        entity: &str,
        request: &GatewayRequest,
    ) -> Result<&Arc<dyn Policy>, GatewayError> {
        self.policies
            .iter()
            .find(|policy| policy.applies_to(entity, request))
            .ok_or(GatewayError::NoApplicablePolicy)
    }

    /// Resolve and await the grant decision.
    pub async fn authorize(
        &self,
        entity: &str,
        request: &GatewayRequest,
    ) -> Result<bool, GatewayError> {
        self.policy_for(entity, request)?.grant(entity, request).await
    }
}

fn build_matcher(spec: &PolicySpec) -> Matcher {
    let mut parts = Vec::new();
    if let Some(entities) = &spec.matcher.entities {
        parts.push(Matcher::Entity(entities.iter().cloned().collect()));
    }
    if let Some(action) = &spec.matcher.action {
        parts.push(Matcher::AwsAction(action.clone()));
    }
    match parts.len() {
        0 => Matcher::Always,
        1 => parts.remove(0),
        _ => Matcher::All(parts),
    }
}
