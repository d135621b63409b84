//! Server-side request/response correlation.
//!
//! A public HTTP request is assigned a request id, forwarded to the
//! owning session as a `request` message, and parked in `pending` under
//! a deadline. The session's reader task resolves the matching entry
//! when a `response`/`error` message with the same request id arrives.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use relay_protocol::{body, Error as ProtoError, Message, RequestData, ResponseData};

use crate::routing::RoutingTable;
use crate::stats::StatsObserver;

/// How long the correlator waits for an agent response before giving up.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(300);

/// A public HTTP request, stripped of its transport framing, to hand to
/// the executor/observer seam independent of the HTTP server in front of it.
#[derive(Debug, Clone)]
pub struct PublicRequest {
    pub tunnel_id: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("no tunnel is registered for this host")]
    NoSuchTunnel,
    #[error("agent reported an error: {0}")]
    AgentError(String),
    #[error("deadline exceeded waiting for the agent's response")]
    Timeout,
    #[error("session closed before a response arrived")]
    SessionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

enum Outcome {
    Response(ResponseData),
    AgentError(String),
}

struct Pending {
    tunnel_id: String,
    reply: oneshot::Sender<Outcome>,
}

pub struct Correlator {
    routing: Arc<RoutingTable>,
    pending: DashMap<Uuid, Pending>,
    observer: Arc<dyn StatsObserver>,
    deadline: Duration,
}

impl Correlator {
    pub fn new(routing: Arc<RoutingTable>, observer: Arc<dyn StatsObserver>) -> Self {
        Self::with_deadline(routing, observer, DEFAULT_REQUEST_DEADLINE)
    }

    /// Builds a correlator with a non-default deadline; used by tests that
    /// need to exercise the timeout path without waiting 30 real seconds.
    pub fn with_deadline(routing: Arc<RoutingTable>, observer: Arc<dyn StatsObserver>, deadline: Duration) -> Self {
        Self {
            routing,
            pending: DashMap::new(),
            observer,
            deadline,
        }
    }

    /// Resolves the owning tunnel for a public request: an explicit
    /// `X-Tunnel-Id` header wins over the host-derived subdomain, so an
    /// operator can address a tunnel directly even without DNS in place.
    pub async fn resolve_tunnel_id(&self, explicit: Option<&str>, subdomain: &str) -> Option<String> {
        if let Some(id) = explicit {
            if self.routing.find_by_tunnel(id).await.is_some() {
                return Some(id.to_string());
            }
        }
        self.routing
            .find_by_subdomain(subdomain)
            .await
            .map(|s| s.tunnel_id.clone())
    }

    pub async fn dispatch(&self, request: PublicRequest) -> Result<ResponseData, CorrelatorError> {
        let session = self
            .routing
            .find_by_tunnel(&request.tunnel_id)
            .await
            .ok_or(CorrelatorError::NoSuchTunnel)?;

        let request_id = Uuid::new_v4();
        let (is_binary, body_text) = body::encode(&request.headers, &request.body);
        let mut headers = request.headers.clone();
        if is_binary {
            headers.push(("X-Relay-Body-Encoding".to_string(), "base64".to_string()));
        }
        let payload = RequestData {
            method: request.method.clone(),
            path: request.path.clone(),
            headers,
            body: body_text,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            Pending {
                tunnel_id: request.tunnel_id.clone(),
                reply: tx,
            },
        );

        let msg = Message::Request {
            request_id: request_id.to_string(),
            data: payload.encode()?,
        };

        if session.send(msg).await.is_err() {
            self.pending.remove(&request_id);
            return Err(CorrelatorError::SessionClosed);
        }

        let outcome = match timeout(self.deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                return Err(CorrelatorError::SessionClosed);
            }
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(CorrelatorError::Timeout);
            }
        };

        match outcome {
            Outcome::Response(data) => Ok(data),
            Outcome::AgentError(reason) => Err(CorrelatorError::AgentError(reason)),
        }
    }

    /// Called by a session's reader task when a `response` message arrives.
    pub fn resolve_response(&self, request_id: &str, data: ResponseData) {
        if let Ok(id) = Uuid::parse_str(request_id) {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Outcome::Response(data));
                return;
            }
        }
        warn!(request_id, "response for unknown or expired request");
    }

    /// Called by a session's reader task when an `error` message arrives.
    pub fn resolve_error(&self, request_id: &str, reason: String) {
        if let Ok(id) = Uuid::parse_str(request_id) {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Outcome::AgentError(reason));
                return;
            }
        }
        warn!(request_id, "error for unknown or expired request");
    }

    /// Fails every pending request that belongs to a session that just
    /// closed, so callers waiting on `dispatch` fail fast instead of
    /// riding out the full deadline.
    pub fn fail_all_for_session(&self, tunnel_id: &str) {
        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().tunnel_id == tunnel_id)
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Outcome::AgentError("session closed".to_string()));
            }
        }
    }

    pub fn observer(&self) -> &Arc<dyn StatsObserver> {
        &self.observer
    }

    /// Whether a session has at least one request awaiting a response.
    /// The liveness sweeper grants such a session an extended timeout
    /// instead of probing it out from under a slow backend call.
    pub fn has_pending_for_session(&self, tunnel_id: &str) -> bool {
        self.pending.iter().any(|entry| entry.value().tunnel_id == tunnel_id)
    }
}
