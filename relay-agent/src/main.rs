use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relay_protocol::{Clock, Message, MessageStream, RequestData, SystemClock};

use relay_agent::reconnect::{tunnel_id_for_attempt, AgentConnectionState, Backoff};
use relay_agent::state::{AgentConfig, AgentState};
use relay_agent::transport::{self, AgentStream};
use relay_agent::{executor, heartbeat};

/// Reverse-tunnel agent: dials the relay, registers a tunnel id, and
/// forwards requests to a local HTTP service.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", version, about)]
struct AgentArgs {
    /// Identifier this agent registers with the relay.
    #[arg(long, env = "RELAY_TUNNEL_ID")]
    tunnel_id: String,

    /// Subdomain to request; the relay may assign a different one if taken.
    #[arg(long)]
    subdomain: Option<String>,

    /// Address of the relay's control channel.
    #[arg(long, env = "RELAY_ADDR", default_value = "127.0.0.1:7000")]
    relay_addr: SocketAddr,

    /// Address of the local HTTP service to forward requests to.
    #[arg(long, env = "LOCAL_ADDR", default_value = "127.0.0.1:8000")]
    local_addr: SocketAddr,

    /// Wrap the control channel in TLS.
    #[arg(long)]
    tls: bool,

    /// Skip server certificate verification. Only meaningful with `--tls`;
    /// intended for a relay with a self-signed certificate in development.
    #[arg(long, requires = "tls")]
    tls_insecure: bool,

    /// Server name to present during the TLS handshake. Defaults to the
    /// relay address's IP when unset.
    #[arg(long, requires = "tls")]
    relay_sni: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_agent=info")),
        )
        .init();

    let args = AgentArgs::parse();
    let config = AgentConfig {
        tunnel_id: args.tunnel_id,
        subdomain: args.subdomain,
        relay_addr: args.relay_addr,
        relay_tls: args.tls,
        relay_tls_insecure: args.tls_insecure,
        relay_sni: args.relay_sni,
        local_addr: args.local_addr,
    };
    let state = AgentState::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut backoff = Backoff::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        state.set_state(AgentConnectionState::Dialing);
        match run_session(&state, clock.clone(), attempt).await {
            Ok(()) => {
                info!("session ended cleanly, reconnecting");
                backoff.record_success(clock.now());
            }
            Err(e) => {
                warn!("session failed: {e}");
            }
        }
        state.set_state(AgentConnectionState::Failing);
        let delay = backoff.record_failure(clock.now());
        state.set_state(AgentConnectionState::Backoff);
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

async fn run_session(state: &Arc<AgentState>, clock: Arc<dyn Clock>, attempt: u32) -> anyhow::Result<()> {
    let config = state.config.clone();
    let tunnel_id = tunnel_id_for_attempt(&config.tunnel_id, config.subdomain.as_deref(), attempt, clock.unix_millis() / 1000);
    let sni = config
        .relay_sni
        .clone()
        .unwrap_or_else(|| config.relay_addr.ip().to_string());
    let stream = transport::dial(config.relay_addr, config.relay_tls, config.relay_tls_insecure, &sni).await?;
    let MessageStream { mut reader, mut writer } = MessageStream::new(stream);

    writer
        .write_message(&Message::Register {
            tunnel_id: tunnel_id.clone(),
            subdomain: config.subdomain.clone(),
        })
        .await?;

    match reader.read_message().await? {
        Some(Message::RegisterConfirm { tunnel_id, status }) => {
            info!(tunnel_id, status, "registered with relay");
        }
        Some(other) => anyhow::bail!("expected register_confirm, got {other:?}"),
        None => anyhow::bail!("relay closed the connection before confirming registration"),
    }
    state.set_state(AgentConnectionState::Registered);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(128);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if writer.write_message(&msg).await.is_err() {
                break;
            }
        }
    });

    // Heartbeats start before the read loop so the relay never observes
    // a silent session while registration is still settling downstream.
    let heartbeat_task = tokio::spawn(heartbeat::run_heartbeat_sender(outbound_tx.clone(), clock.clone()));
    let watchdog = Arc::new(heartbeat::Watchdog::new(clock.clone()));
    let watchdog_task = {
        let watchdog = watchdog.clone();
        tokio::spawn(async move { watchdog.run().await })
    };

    state.set_state(AgentConnectionState::Running);
    let local_addr = config.local_addr;

    let result = tokio::select! {
        res = read_loop(&mut reader, &watchdog, local_addr, outbound_tx.clone()) => res,
        _ = watchdog_task => Err(anyhow::anyhow!("watchdog timed out waiting for relay traffic")),
    };

    heartbeat_task.abort();
    writer_task.abort();
    result
}

async fn read_loop(
    reader: &mut relay_protocol::framing::MessageReader<ReadHalf<AgentStream>>,
    watchdog: &heartbeat::Watchdog,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
) -> anyhow::Result<()> {
    loop {
        let msg = match reader.read_message().await? {
            Some(msg) => msg,
            None => return Ok(()),
        };
        watchdog.touch();

        match msg {
            Message::HeartbeatResponse { .. } | Message::Pong { .. } => {}
            Message::Ping { timestamp } => {
                let _ = outbound
                    .send(Message::Pong {
                        timestamp,
                        original_timestamp: timestamp,
                    })
                    .await;
            }
            Message::Request { request_id, data } => {
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    handle_request(local_addr, request_id, data, outbound).await;
                });
            }
            Message::Unknown => {}
            other => {
                warn!(?other, "unexpected message on control channel");
            }
        }
    }
}

async fn handle_request(local_addr: SocketAddr, request_id: String, data: String, outbound: mpsc::Sender<Message>) {
    let request = match RequestData::decode(&data) {
        Ok(r) => r,
        Err(e) => {
            let _ = outbound
                .send(Message::Error {
                    request_id,
                    error: format!("malformed request payload: {e}"),
                })
                .await;
            return;
        }
    };

    match executor::execute(local_addr, &request_id, &request, &outbound).await {
        Ok(response) => match response.encode() {
            Ok(encoded) => {
                let _ = outbound.send(Message::Response { request_id, data: encoded }).await;
            }
            Err(e) => {
                let _ = outbound
                    .send(Message::Error { request_id, error: e.to_string() })
                    .await;
            }
        },
        Err(e) => {
            error!(request_id, "local request failed: {e}");
            let _ = outbound
                .send(Message::Error { request_id, error: e.to_string() })
                .await;
        }
    }
}
