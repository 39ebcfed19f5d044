//! The request pipeline
//!
//! For every inbound request the gateway walks the configured rulesets in
//! declaration order and hands the request to the first one whose match
//! stage accepts it — exactly one ruleset ever processes a request. Within
//! that ruleset the stages run strictly in order: filter, authorization
//! (when policies are configured), modify_request, upstream proxy,
//! modify_response, then the audit stages.
//!
//! Outcomes: a filter or policy denial is 403 "Verboten"; an unmatched
//! request is 501; any error while processing the selected ruleset is
//! caught here and becomes 500 — nothing propagates past the pipeline.

use crate::error::GatewayError;
use crate::metrics::{outcome, Metrics};
use crate::policy::PolicySet;
use crate::proxy::ProxyClient;
use crate::rules::CompiledRuleset;
use crate::types::{GatewayRequest, GatewayResponse};
use axum::http::StatusCode;
use std::sync::Arc;
use tracing::{debug, warn};

const DENIED_BODY: &str = "Verboten\n";
const ERROR_BODY: &str = "Internal Server Error\n";
const UNMATCHED_BODY: &str = "no ruleset matched this request\n";

/// Immutable, fully-compiled gateway state shared by all requests.
pub struct Gateway {
    rulesets: Vec<CompiledRuleset>,
    policies: PolicySet,
    proxy: ProxyClient,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        rulesets: Vec<CompiledRuleset>,
        policies: PolicySet,
        proxy: ProxyClient,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rulesets,
            policies,
            proxy,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Route the request to the first matching ruleset and produce a
    /// response. Never fails: errors become status-coded responses here.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        for ruleset in &self.rulesets {
            if !ruleset.matches(&request) {
                continue;
            }
            debug!(ruleset = ruleset.index, method = %request.method, path = %request.path, "ruleset selected");

            return match self.process(ruleset, request).await {
                Ok(response) => {
                    let label = if response.status == StatusCode::FORBIDDEN {
                        outcome::DENIED
                    } else {
                        outcome::PROXIED
                    };
                    self.metrics.requests_total.with_label_values(&[label]).inc();
                    response
                }
                Err(error) => {
                    if matches!(error, GatewayError::Upstream(_)) {
                        self.metrics.upstream_failures_total.inc();
                    }
                    match error.status() {
                        StatusCode::FORBIDDEN => {
                            debug!(%error, "request denied");
                            self.metrics
                                .requests_total
                                .with_label_values(&[outcome::DENIED])
                                .inc();
                            GatewayResponse::text(StatusCode::FORBIDDEN, DENIED_BODY)
                        }
                        _ => {
                            warn!(%error, "request processing failed");
                            self.metrics
                                .requests_total
                                .with_label_values(&[outcome::ERROR])
                                .inc();
                            GatewayResponse::text(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                ERROR_BODY,
                            )
                        }
                    }
                }
            };
        }

        debug!(method = %request.method, path = %request.path, "no ruleset matched");
        self.metrics
            .requests_total
            .with_label_values(&[outcome::UNMATCHED])
            .inc();
        GatewayResponse::text(StatusCode::NOT_IMPLEMENTED, UNMATCHED_BODY)
    }

    async fn process(
        &self,
        ruleset: &CompiledRuleset,
        mut request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if !ruleset.filter(&mut request)? {
            debug!(ruleset = ruleset.index, "filter stage denied the request");
            return Ok(GatewayResponse::text(StatusCode::FORBIDDEN, DENIED_BODY));
        }

        if !self.policies.is_empty() {
            let entity = request.remote_user.clone().unwrap_or_default();
            if !self.policies.authorize(&entity, &request).await? {
                debug!(ruleset = ruleset.index, %entity, "policy denied the request");
                return Ok(GatewayResponse::text(StatusCode::FORBIDDEN, DENIED_BODY));
            }
        }

        let request = ruleset.modify_request(request)?;
        let response = self.proxy.forward(&request).await?;
        let response = ruleset.modify_response(response)?;
        ruleset.audit_request(&request)?;
        ruleset.audit_response(&response)?;
        Ok(response)
    }
}
