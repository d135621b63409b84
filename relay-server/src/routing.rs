//! Tunnel-id/subdomain routing table.
//!
//! A [`Session`] represents one live agent connection. The table is
//! kept behind a single lock so a re-registration can evict the old
//! entry and install the new one atomically — a reader can never
//! observe a subdomain pointing at a tunnel id the `by_tunnel` map no
//! longer has an entry for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use relay_protocol::clock::{Clock, SystemClock};
use relay_protocol::Message;

/// Outbound queue depth for a single session's writer task.
const SESSION_OUTBOX_CAPACITY: usize = 256;

pub struct Session {
    pub tunnel_id: String,
    pub subdomain: Option<String>,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    last_activity_ms: AtomicI64,
}

impl Session {
    pub fn new(tunnel_id: String, subdomain: Option<String>) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(SESSION_OUTBOX_CAPACITY);
        (
            Arc::new(Self {
                tunnel_id,
                subdomain,
                outbound: tx,
                closed: AtomicBool::new(false),
                last_activity_ms: AtomicI64::new(SystemClock.unix_millis()),
            }),
            rx,
        )
    }

    /// Queues a message for the session's writer task. Fails once the
    /// session's connection has gone away, its writer has dropped, or
    /// the session was evicted by a re-registration under the same id.
    pub async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(mpsc::error::SendError(msg));
        }
        self.outbound.send(msg).await
    }

    /// Marks the session closed so any further `send` fails immediately,
    /// even though the underlying channel may still have live senders.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Records that a message was received on this session just now.
    pub fn touch(&self) {
        self.last_activity_ms.store(SystemClock.unix_millis(), Ordering::Relaxed);
    }

    /// Unix milliseconds of the last message seen on this session.
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Inner {
    by_tunnel: HashMap<String, Arc<Session>>,
    by_subdomain: HashMap<String, String>,
}

#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session`, evicting any prior session on the same tunnel
    /// id or subdomain first. Returns the evicted session, if any.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;

        let evicted = inner.by_tunnel.remove(&session.tunnel_id);
        if let Some(prev) = &evicted {
            if let Some(sub) = &prev.subdomain {
                inner.by_subdomain.remove(sub);
            }
            // Close before the new session is installed so no caller can
            // observe a stale session whose writer still looks usable.
            prev.close();
            warn!(tunnel_id = %session.tunnel_id, "re-registration evicted prior session");
        }

        if let Some(sub) = &session.subdomain {
            if let Some(stale_tunnel) = inner.by_subdomain.insert(sub.clone(), session.tunnel_id.clone()) {
                if stale_tunnel != session.tunnel_id {
                    inner.by_tunnel.remove(&stale_tunnel);
                }
            }
        }

        inner.by_tunnel.insert(session.tunnel_id.clone(), session);
        evicted
    }

    pub async fn remove(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.by_tunnel.remove(tunnel_id)?;
        if let Some(sub) = &session.subdomain {
            if inner.by_subdomain.get(sub) == Some(&session.tunnel_id) {
                inner.by_subdomain.remove(sub);
            }
        }
        session.close();
        Some(session)
    }

    pub async fn find_by_tunnel(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.by_tunnel.get(tunnel_id).cloned()
    }

    pub async fn find_by_subdomain(&self, subdomain: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        let tunnel_id = inner.by_subdomain.get(subdomain)?;
        inner.by_tunnel.get(tunnel_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_tunnel.len()
    }

    /// A consistent listing of every registered session: its tunnel id,
    /// subdomain (if any), and last-activity timestamp in Unix millis.
    pub async fn snapshot(&self) -> Vec<(String, Option<String>, i64)> {
        self.inner
            .read()
            .await
            .by_tunnel
            .values()
            .map(|s| (s.tunnel_id.clone(), s.subdomain.clone(), s.last_activity_ms()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_resolves_by_subdomain() {
        let table = RoutingTable::new();
        let (session, _rx) = Session::new("t1".into(), Some("alpha".into()));
        table.register(session).await;

        let found = table.find_by_subdomain("alpha").await.unwrap();
        assert_eq!(found.tunnel_id, "t1");
    }

    #[tokio::test]
    async fn reregistering_a_tunnel_id_evicts_the_old_subdomain_mapping() {
        let table = RoutingTable::new();
        let (s1, _rx1) = Session::new("t1".into(), Some("alpha".into()));
        table.register(s1).await;

        let (s2, _rx2) = Session::new("t1".into(), Some("beta".into()));
        let evicted = table.register(s2).await;
        assert!(evicted.is_some());

        assert!(table.find_by_subdomain("alpha").await.is_none());
        let found = table.find_by_subdomain("beta").await.unwrap();
        assert_eq!(found.tunnel_id, "t1");
    }

    #[tokio::test]
    async fn removing_a_session_never_leaves_an_orphan_subdomain_entry() {
        let table = RoutingTable::new();
        let (session, _rx) = Session::new("t1".into(), Some("alpha".into()));
        table.register(session).await;

        table.remove("t1").await;
        assert!(table.find_by_subdomain("alpha").await.is_none());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn reregistering_a_tunnel_id_closes_the_evicted_sessions_writer() {
        let table = RoutingTable::new();
        let (s1, _rx1) = Session::new("t1".into(), None);
        table.register(s1.clone()).await;

        let (s2, _rx2) = Session::new("t1".into(), None);
        table.register(s2).await;

        let err = s1.send(Message::Ping { timestamp: 1 }).await.unwrap_err();
        assert!(matches!(err, mpsc::error::SendError(Message::Ping { .. })));
    }

    #[tokio::test]
    async fn two_tunnels_claiming_the_same_subdomain_leave_only_the_latest_routable() {
        let table = RoutingTable::new();
        let (s1, _rx1) = Session::new("t1".into(), Some("shared".into()));
        table.register(s1).await;
        let (s2, _rx2) = Session::new("t2".into(), Some("shared".into()));
        table.register(s2).await;

        let found = table.find_by_subdomain("shared").await.unwrap();
        assert_eq!(found.tunnel_id, "t2");
        assert!(table.find_by_tunnel("t1").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_reports_every_session_with_its_last_activity() {
        let table = RoutingTable::new();
        let (session, _rx) = Session::new("t1".into(), Some("alpha".into()));
        table.register(session.clone()).await;

        let before = session.last_activity_ms();
        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let (id, subdomain, last_activity) = &snapshot[0];
        assert_eq!(id, "t1");
        assert_eq!(subdomain.as_deref(), Some("alpha"));
        assert_eq!(*last_activity, before);

        session.touch();
        let snapshot = table.snapshot().await;
        assert!(snapshot[0].2 >= before);
    }
}
