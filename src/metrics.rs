//! Prometheus metrics for the gateway.
//!
//! Counters are cheap atomics; the pipeline bumps them inline and the
//! control listener exposes the encoded registry at `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Outcome label values for `goldengate_requests_total`.
pub mod outcome {
    pub const PROXIED: &str = "proxied";
    pub const DENIED: &str = "denied";
    pub const ERROR: &str = "error";
    pub const UNMATCHED: &str = "unmatched";
}

pub struct Metrics {
    pub registry: Registry,

    /// Requests by final outcome.
    pub requests_total: IntCounterVec,

    /// Failed upstream exchanges (connect errors, timeouts, torn bodies).
    pub upstream_failures_total: IntCounter,

    /// Time locks cancelled through the control listener.
    pub timelocks_cancelled_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("goldengate_requests_total", "Requests by final outcome"),
            &["outcome"],
        )
        .expect("static metric definition");
        let upstream_failures_total = IntCounter::new(
            "goldengate_upstream_failures_total",
            "Failed upstream exchanges",
        )
        .expect("static metric definition");
        let timelocks_cancelled_total = IntCounter::new(
            "goldengate_timelocks_cancelled_total",
            "Time locks cancelled via the control listener",
        )
        .expect("static metric definition");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(upstream_failures_total.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(timelocks_cancelled_total.clone()))
            .expect("metric registered once");

        Self {
            registry,
            requests_total,
            upstream_failures_total,
            timelocks_cancelled_total,
        }
    }

    /// Text exposition format for the control listener.
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
