//! goldengate — policy-driven signing reverse proxy
//!
//! Clients sign requests with their own per-user keys; the gateway
//! authenticates them, applies declarative policy (allow, deny, or a
//! cancellable time-lock), rewrites the request and re-signs it with the
//! privileged upstream credentials before proxying. The shared upstream
//! secret never leaves the gateway.

pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod sigv2;
pub mod timelock;
pub mod types;
