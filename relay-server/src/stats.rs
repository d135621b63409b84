//! Pure observer hook for request/session statistics.
//!
//! Every method takes `&self` and returns nothing observable to the
//! caller; an implementation is free to count, log, or export metrics,
//! but it must never influence routing or response content. This keeps
//! the request path testable without a metrics backend wired in.

use std::fmt;

use tracing::info;

use crate::correlator::PublicRequest;

pub trait StatsObserver: Send + Sync + fmt::Debug {
    fn on_session_registered(&self, tunnel_id: &str, subdomain: Option<&str>) {
        let _ = (tunnel_id, subdomain);
    }

    fn on_session_closed(&self, tunnel_id: &str) {
        let _ = tunnel_id;
    }

    fn on_request_completed(&self, request: &PublicRequest, status: u16, latency_ms: u64) {
        let _ = (request, status, latency_ms);
    }

    fn on_request_failed(&self, request: &PublicRequest, reason: &str) {
        let _ = (request, reason);
    }
}

/// Discards every observation. Used by tests and minimal deployments.
#[derive(Debug, Default)]
pub struct NullObserver;

impl StatsObserver for NullObserver {}

/// Emits each observation as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl StatsObserver for TracingObserver {
    fn on_session_registered(&self, tunnel_id: &str, subdomain: Option<&str>) {
        info!(tunnel_id, subdomain, "session registered");
    }

    fn on_session_closed(&self, tunnel_id: &str) {
        info!(tunnel_id, "session closed");
    }

    fn on_request_completed(&self, request: &PublicRequest, status: u16, latency_ms: u64) {
        info!(
            tunnel_id = %request.tunnel_id,
            method = %request.method,
            path = %request.path,
            status,
            latency_ms,
            "request completed"
        );
    }

    fn on_request_failed(&self, request: &PublicRequest, reason: &str) {
        info!(
            tunnel_id = %request.tunnel_id,
            method = %request.method,
            path = %request.path,
            reason,
            "request failed"
        );
    }
}
