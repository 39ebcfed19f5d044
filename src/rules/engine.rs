//! Ruleset compilation and stage execution
//!
//! A [`CompiledRuleset`] holds the six stages of one config document as
//! trait objects. Stage semantics:
//!
//! - `match`: short-circuit AND; an empty stage matches everything.
//! - `filter`: the first rule decides. A `permit` rule yields its predicate,
//!   a `reject` rule yields its negation. An empty filter stage denies.
//! - `modify_request` / `modify_response`: each rule's output feeds the next.
//! - `audit_request` / `audit_response`: side effects only; the message the
//!   pipeline carries forward is untouched.

use super::{
    FilterAction, FilterRule, HttpMessage, MatchRule, RuleLine, RuleRegistry, StageKind,
    TransformRule,
};
use crate::config::{ConfigError, RawRuleset};
use crate::error::GatewayError;
use crate::types::{GatewayRequest, GatewayResponse};
use tracing::debug;

/// A filter rule together with its permit/reject action.
struct CompiledFilter {
    action: FilterAction,
    rule: Box<dyn FilterRule>,
}

/// One ruleset document, compiled and ready to serve.
pub struct CompiledRuleset {
    /// Position in the config stream, used in logs.
    pub index: usize,
    match_rules: Vec<Box<dyn MatchRule>>,
    filter_rules: Vec<CompiledFilter>,
    modify_request: Vec<Box<dyn TransformRule>>,
    modify_response: Vec<Box<dyn TransformRule>>,
    audit_request: Vec<Box<dyn TransformRule>>,
    audit_response: Vec<Box<dyn TransformRule>>,
}

impl CompiledRuleset {
    /// Compile one config document. Any unknown verb, bad argument or
    /// unreadable referenced file fails here, before traffic is accepted.
    pub fn compile(
        index: usize,
        raw: &RawRuleset,
        registry: &RuleRegistry,
    ) -> Result<Self, ConfigError> {
        let mut ruleset = CompiledRuleset {
            index,
            match_rules: Vec::new(),
            filter_rules: Vec::new(),
            modify_request: Vec::new(),
            modify_response: Vec::new(),
            audit_request: Vec::new(),
            audit_response: Vec::new(),
        };

        for (stage_name, lines) in raw {
            // Stage names were validated when the YAML was parsed.
            let stage = StageKind::from_name(stage_name)
                .ok_or_else(|| ConfigError::rule(stage_name, "unknown stage"))?;
            for line in lines {
                let parsed = RuleLine::parse(line, stage)?;
                match stage {
                    StageKind::Match => {
                        ruleset.match_rules.push(registry.compile_match(&parsed)?);
                    }
                    StageKind::Filter => {
                        let action = parsed.action.expect("filter lines carry an action");
                        ruleset.filter_rules.push(CompiledFilter {
                            action,
                            rule: registry.compile_filter(&parsed)?,
                        });
                    }
                    StageKind::ModifyRequest => {
                        ruleset.modify_request.push(registry.compile_modify(&parsed)?);
                    }
                    StageKind::ModifyResponse => {
                        ruleset
                            .modify_response
                            .push(registry.compile_modify(&parsed)?);
                    }
                    StageKind::AuditRequest => {
                        ruleset.audit_request.push(registry.compile_modify(&parsed)?);
                    }
                    StageKind::AuditResponse => {
                        ruleset
                            .audit_response
                            .push(registry.compile_modify(&parsed)?);
                    }
                }
            }
        }

        Ok(ruleset)
    }

    /// Does this ruleset claim the request?
    pub fn matches(&self, request: &GatewayRequest) -> bool {
        self.match_rules.iter().all(|rule| rule.eval(request))
    }

    /// Permit or reject the request. The first rule to produce a decision
    /// wins, and every rule produces one, so the first rule listed decides
    /// and the rest are unreachable.
    pub fn filter(&self, request: &mut GatewayRequest) -> Result<bool, GatewayError> {
        match self.filter_rules.first() {
            Some(filter) => {
                let verdict = filter.rule.permit(request)?;
                Ok(match filter.action {
                    FilterAction::Permit => verdict,
                    FilterAction::Reject => !verdict,
                })
            }
            None => {
                // A ruleset that routes traffic must say so explicitly.
                debug!(ruleset = self.index, "empty filter stage denies");
                Ok(false)
            }
        }
    }

    pub fn modify_request(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayRequest, GatewayError> {
        let mut message = HttpMessage::Request(request);
        for rule in &self.modify_request {
            rule.apply(&mut message)?;
        }
        match message {
            HttpMessage::Request(request) => Ok(request),
            HttpMessage::Response(_) => unreachable!("transforms preserve the message kind"),
        }
    }

    pub fn modify_response(
        &self,
        response: GatewayResponse,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut message = HttpMessage::Response(response);
        for rule in &self.modify_response {
            rule.apply(&mut message)?;
        }
        match message {
            HttpMessage::Response(response) => Ok(response),
            HttpMessage::Request(_) => unreachable!("transforms preserve the message kind"),
        }
    }

    /// Run audit rules over a throwaway copy; the pipeline's request is
    /// returned to the caller unchanged.
    pub fn audit_request(&self, request: &GatewayRequest) -> Result<(), GatewayError> {
        let mut message = HttpMessage::Request(request.clone());
        for rule in &self.audit_request {
            rule.apply(&mut message)?;
        }
        Ok(())
    }

    pub fn audit_response(&self, response: &GatewayResponse) -> Result<(), GatewayError> {
        let mut message = HttpMessage::Response(response.clone());
        for rule in &self.audit_response {
            rule.apply(&mut message)?;
        }
        Ok(())
    }
}

/// Compile every document of the config stream, in declaration order.
pub fn compile_all(
    raw: &[RawRuleset],
    registry: &RuleRegistry,
) -> Result<Vec<CompiledRuleset>, ConfigError> {
    raw.iter()
        .enumerate()
        .map(|(index, ruleset)| CompiledRuleset::compile(index, ruleset, registry))
        .collect()
}
