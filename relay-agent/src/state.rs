//! Shared agent state: static config plus the live connection state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::reconnect::AgentConnectionState;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub tunnel_id: String,
    pub subdomain: Option<String>,
    pub relay_addr: SocketAddr,
    pub relay_tls: bool,
    pub relay_tls_insecure: bool,
    pub relay_sni: Option<String>,
    pub local_addr: SocketAddr,
}

pub struct AgentState {
    pub config: AgentConfig,
    connection_state: watch::Sender<AgentConnectionState>,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let (tx, _rx) = watch::channel(AgentConnectionState::Idle);
        Arc::new(Self {
            config,
            connection_state: tx,
        })
    }

    pub fn set_state(&self, state: AgentConnectionState) {
        let _ = self.connection_state.send(state);
    }

    pub fn current_state(&self) -> AgentConnectionState {
        *self.connection_state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<AgentConnectionState> {
        self.connection_state.subscribe()
    }
}
