//! Agent-side heartbeat sender and liveness watchdog.
//!
//! The sender is spawned before the control-channel read loop starts,
//! so a heartbeat goes out even if the very first inbound message takes
//! a while to arrive — a session is never silently idle from the
//! server's point of view while this task is alive.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use relay_protocol::{Clock, Message};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends a `heartbeat` message on `outbound` every [`HEARTBEAT_INTERVAL`]
/// until the channel closes.
pub async fn run_heartbeat_sender(outbound: mpsc::Sender<Message>, clock: Arc<dyn Clock>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut count: u64 = 0;
    loop {
        interval.tick().await;
        count += 1;
        let msg = Message::Heartbeat {
            timestamp: Some(clock.unix_millis()),
            count: Some(count),
        };
        if outbound.send(msg).await.is_err() {
            break;
        }
    }
}

/// Tracks the last time any inbound control message was observed.
/// `run_watchdog` declares the connection dead once it has been silent
/// for longer than [`WATCHDOG_TIMEOUT`].
pub struct Watchdog {
    last_seen_millis: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl Watchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.unix_millis();
        Self {
            last_seen_millis: AtomicI64::new(now),
            clock,
        }
    }

    pub fn touch(&self) {
        self.last_seen_millis.store(self.clock.unix_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_seen_millis.load(Ordering::Relaxed);
        let now = self.clock.unix_millis();
        Duration::from_millis(now.saturating_sub(last).max(0) as u64)
    }

    /// Polls until the connection has been silent for longer than the
    /// timeout, then returns. Intended to be raced against the read loop
    /// with `tokio::select!`.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            if self.idle_for() >= WATCHDOG_TIMEOUT {
                warn!("control channel silent past the watchdog timeout");
                return;
            }
        }
    }
}
