//! Server-side liveness tracking for a registered session.
//!
//! A session starts `Connecting`, moves to `Registered` once its first
//! heartbeat lands, and alternates `Healthy`/`Probing` after that. When
//! a session goes quiet past its timeout the sweeper sends it a `ping`
//! and gives it a short grace window to answer before declaring it
//! `Dead` and evicting it from the routing table, so public traffic
//! stops being routed to a connection nobody is answering on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use relay_protocol::clock::{Clock, SystemClock};
use relay_protocol::Message;

use crate::correlator::Correlator;
use crate::routing::RoutingTable;
use crate::stats::StatsObserver;

/// How often the sweeper scans for stale sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// A session that hasn't sent anything in this long is probed.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(180);
/// How long a probed session has to answer before it's declared dead.
pub const PROBE_GRACE: Duration = Duration::from_secs(2);
/// Timeout granted to a session with at least one request in flight,
/// so a slow backend call doesn't get mistaken for a dead agent.
pub const EXTENDED_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLivenessState {
    Connecting,
    Registered,
    Healthy,
    Probing,
    Dead,
}

struct Entry {
    state: SessionLivenessState,
    last_seen: Instant,
}

/// Tracks the liveness state of every registered session, keyed by tunnel id.
pub struct LivenessTracker {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    probe_grace: Duration,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), PROBE_GRACE)
    }

    /// Builds a tracker with an injected clock and grace window; used by
    /// tests that need to exercise the probe path without a real sleep.
    pub fn with_clock(clock: Arc<dyn Clock>, probe_grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            probe_grace,
        }
    }

    pub async fn mark_connecting(&self, tunnel_id: &str) {
        self.entries.lock().await.insert(
            tunnel_id.to_string(),
            Entry {
                state: SessionLivenessState::Connecting,
                last_seen: self.clock.now(),
            },
        );
    }

    pub async fn mark_registered(&self, tunnel_id: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(tunnel_id) {
            entry.state = SessionLivenessState::Registered;
            entry.last_seen = self.clock.now();
        }
    }

    /// Records activity on a session, returning it to `Healthy` from
    /// whatever state it was last observed in. Called for every inbound
    /// control message, not only heartbeats and pongs.
    pub async fn record_activity(&self, tunnel_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(tunnel_id) {
            entry.state = SessionLivenessState::Healthy;
            entry.last_seen = self.clock.now();
        }
    }

    pub async fn state_of(&self, tunnel_id: &str) -> Option<SessionLivenessState> {
        self.entries.lock().await.get(tunnel_id).map(|e| e.state)
    }

    pub async fn remove(&self, tunnel_id: &str) {
        self.entries.lock().await.remove(tunnel_id);
    }

    /// Scans every tracked session, probing anything idle past its
    /// timeout with a `ping` and waiting `probe_grace` for an answer.
    /// A session with a request in flight (per `correlator`) is granted
    /// `EXTENDED_TIMEOUT` instead of `HEARTBEAT_TIMEOUT`. A session that
    /// hasn't answered by the end of the grace window is declared dead,
    /// removed from the tracker, and returned to the caller for eviction.
    async fn sweep_once(&self, routing: &RoutingTable, correlator: &Correlator) -> Vec<String> {
        let now = self.clock.now();
        let mut candidates = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for (tunnel_id, entry) in entries.iter_mut() {
                if entry.state == SessionLivenessState::Probing {
                    continue;
                }
                let idle = now.duration_since(entry.last_seen);
                let threshold = if correlator.has_pending_for_session(tunnel_id) {
                    EXTENDED_TIMEOUT
                } else {
                    HEARTBEAT_TIMEOUT
                };
                if idle >= threshold {
                    entry.state = SessionLivenessState::Probing;
                    candidates.push(tunnel_id.clone());
                }
            }
        }

        if candidates.is_empty() {
            return Vec::new();
        }

        for tunnel_id in &candidates {
            warn!(tunnel_id, "session missed its timeout, probing");
            if let Some(session) = routing.find_by_tunnel(tunnel_id).await {
                let ping = Message::Ping { timestamp: self.clock.unix_millis() };
                let _ = session.send(ping).await;
            }
        }

        tokio::time::sleep(self.probe_grace).await;

        let mut dead = Vec::new();
        let mut entries = self.entries.lock().await;
        for tunnel_id in &candidates {
            // A pong or any other message during the grace window flips
            // the entry back to `Healthy` via `record_activity`; anything
            // still `Probing` never answered.
            if matches!(entries.get(tunnel_id).map(|e| e.state), Some(SessionLivenessState::Probing)) {
                entries.remove(tunnel_id);
                dead.push(tunnel_id.clone());
            }
        }
        dead
    }
}

/// Runs forever, periodically evicting sessions the sweeper declares dead.
pub async fn run_sweeper(
    tracker: Arc<LivenessTracker>,
    routing: Arc<RoutingTable>,
    correlator: Arc<Correlator>,
    observer: Arc<dyn StatsObserver>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let dead = tracker.sweep_once(&routing, &correlator).await;
        for tunnel_id in dead {
            if routing.remove(&tunnel_id).await.is_some() {
                info!(tunnel_id = %tunnel_id, "evicting dead session");
                correlator.fail_all_for_session(&tunnel_id);
                observer.on_session_closed(&tunnel_id);
            }
        }
    }
}
