//! Control-channel accept loop and per-session reader/writer tasks.
//!
//! Grounded on the split-socket, channel-fed pattern the agent side
//! originally used for its own WebSocket connection: one task owns the
//! write half and drains an mpsc channel, one task owns the read half
//! and dispatches incoming frames, and the two only ever talk to each
//! other through [`routing::Session`]'s outbound channel.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use relay_protocol::{Message, MessageStream, ResponseData};

use crate::correlator::Correlator;
use crate::liveness::LivenessTracker;
use crate::routing::{RoutingTable, Session};
use crate::stats::StatsObserver;

/// Default cap on concurrently registered control sessions (spec.md §5).
pub const DEFAULT_MAX_SESSIONS: usize = 100;

pub struct ControlPlane {
    pub routing: Arc<RoutingTable>,
    pub correlator: Arc<Correlator>,
    pub liveness: Arc<LivenessTracker>,
    pub observer: Arc<dyn StatsObserver>,
    /// Bounds concurrently registered sessions; a connection beyond the cap
    /// waits for `acquire()` rather than being dropped.
    pub session_slots: Arc<Semaphore>,
}

impl ControlPlane {
    pub fn new(
        routing: Arc<RoutingTable>,
        correlator: Arc<Correlator>,
        liveness: Arc<LivenessTracker>,
        observer: Arc<dyn StatsObserver>,
        max_sessions: usize,
    ) -> Self {
        Self {
            routing,
            correlator,
            liveness,
            observer,
            session_slots: Arc::new(Semaphore::new(max_sessions)),
        }
    }
}

/// Accepts plain-TCP control connections forever.
pub async fn run_plain_accept_loop(listener: TcpListener, plane: Arc<ControlPlane>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(%peer, "control connection accepted");
                let plane = plane.clone();
                tokio::spawn(async move {
                    serve_session(socket, plane).await;
                });
            }
            Err(e) => warn!("control accept error: {e}"),
        }
    }
}

/// Accepts TLS-wrapped control connections forever.
pub async fn run_tls_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    plane: Arc<ControlPlane>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let acceptor = acceptor.clone();
                let plane = plane.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(tls_stream) => {
                            info!(%peer, "tls control connection accepted");
                            serve_session(tls_stream, plane).await;
                        }
                        Err(e) => warn!(%peer, "tls handshake failed: {e}"),
                    }
                });
            }
            Err(e) => warn!("control accept error: {e}"),
        }
    }
}

/// Drives one control connection from registration through close. Blocks
/// on a session slot before touching the routing table, so connections
/// beyond the cap wait in place instead of being rejected.
async fn serve_session<S>(stream: S, plane: Arc<ControlPlane>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Ok(_permit) = plane.session_slots.clone().acquire_owned().await else {
        return;
    };
    let MessageStream { mut reader, mut writer } = MessageStream::new(stream);

    let first = match reader.read_message().await {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(e) => {
            warn!("failed to read registration: {e}");
            return;
        }
    };

    let (tunnel_id, subdomain) = match first {
        Message::Register { tunnel_id, subdomain } => (tunnel_id, subdomain),
        other => {
            warn!(?other, "first control message was not a registration");
            return;
        }
    };

    plane.liveness.mark_connecting(&tunnel_id).await;

    let (session, mut outbound_rx) = Session::new(tunnel_id.clone(), subdomain.clone());
    if plane.routing.register(session.clone()).await.is_some() {
        // The evicted session's writer is already closed; fail anything
        // still parked against it rather than riding out the deadline.
        plane.correlator.fail_all_for_session(&tunnel_id);
    }
    plane.liveness.mark_registered(&tunnel_id).await;
    plane.observer.on_session_registered(&tunnel_id, subdomain.as_deref());

    let confirm = Message::RegisterConfirm {
        tunnel_id: tunnel_id.clone(),
        status: "ok".to_string(),
    };
    if writer.write_message(&confirm).await.is_err() {
        plane.routing.remove(&tunnel_id).await;
        plane.liveness.remove(&tunnel_id).await;
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if writer.write_message(&msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match reader.read_message().await {
            Ok(Some(msg)) => {
                if !dispatch_inbound(&plane, &tunnel_id, msg).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, "control read error: {e}");
                break;
            }
        }
    }

    writer_task.abort();
    plane.routing.remove(&tunnel_id).await;
    plane.liveness.remove(&tunnel_id).await;
    plane.correlator.fail_all_for_session(&tunnel_id);
    plane.observer.on_session_closed(&tunnel_id);
    info!(tunnel_id = %tunnel_id, "control session closed");
}

/// Handles one message from the agent. Returns `false` if the session
/// should be torn down.
///
/// Last-activity is refreshed here, before dispatch, for every message
/// kind the agent can send, not only heartbeats and pongs.
async fn dispatch_inbound(plane: &Arc<ControlPlane>, tunnel_id: &str, msg: Message) -> bool {
    plane.liveness.record_activity(tunnel_id).await;
    if let Some(session) = plane.routing.find_by_tunnel(tunnel_id).await {
        session.touch();
    }

    match msg {
        Message::Heartbeat { .. } => {
            if let Some(session) = plane.routing.find_by_tunnel(tunnel_id).await {
                let _ = session
                    .send(Message::HeartbeatResponse {
                        timestamp: None,
                        original_timestamp: None,
                        server_time: None,
                    })
                    .await;
            }
        }
        Message::Pong { .. } => {}
        Message::Response { request_id, data } => match ResponseData::decode(&data) {
            Ok(response) => plane.correlator.resolve_response(&request_id, response),
            Err(e) => warn!(request_id, "malformed response payload: {e}"),
        },
        Message::Error { request_id, error } => {
            plane.correlator.resolve_error(&request_id, error);
        }
        Message::Progress { request_id, message, .. } => {
            info!(request_id, message, "agent progress");
        }
        Message::Register { .. } => {
            warn!(tunnel_id, "duplicate registration on an active session, closing");
            return false;
        }
        Message::Unknown => {}
        other => {
            warn!(tunnel_id, ?other, "unexpected message on control channel");
        }
    }
    true
}
