use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use relay_server::control::{self, ControlPlane, DEFAULT_MAX_SESSIONS};
use relay_server::correlator::Correlator;
use relay_server::liveness::{self, LivenessTracker};
use relay_server::routing::RoutingTable;
use relay_server::stats::{StatsObserver, TracingObserver};
use relay_server::{http, tlsconfig};

/// Reverse-tunnel relay: accepts agent control connections and routes
/// public HTTP traffic to the matching tunnel.
#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about)]
struct ServerArgs {
    /// Address the control channel listens on for agent connections.
    #[arg(long, default_value = "0.0.0.0:7000")]
    control_addr: SocketAddr,

    /// Address the public HTTP listener binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Maximum concurrently registered control sessions. Connections
    /// beyond the cap wait for a slot instead of being dropped.
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Wrap the control channel in TLS.
    #[arg(long)]
    tls: bool,

    /// PEM certificate chain for the control channel. Required with `--tls`.
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the control channel. Required with `--tls`.
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_server=info")),
        )
        .init();

    let args = ServerArgs::parse();

    let routing = Arc::new(RoutingTable::new());
    let observer: Arc<dyn StatsObserver> = Arc::new(TracingObserver);
    let correlator = Arc::new(Correlator::new(routing.clone(), observer.clone()));
    let liveness = Arc::new(LivenessTracker::new());

    let plane = Arc::new(ControlPlane::new(
        routing.clone(),
        correlator.clone(),
        liveness.clone(),
        observer.clone(),
        args.max_sessions,
    ));

    let control_listener = TcpListener::bind(args.control_addr).await?;
    info!(addr = %args.control_addr, "control channel listening");
    let control_task = if args.tls {
        let cert_path = args
            .tls_cert
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--tls-cert is required with --tls"))?;
        let key_path = args
            .tls_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--tls-key is required with --tls"))?;
        let (certs, key) = tlsconfig::load(cert_path, key_path)?;
        let server_config = relay_protocol::tls::server_config(certs, key)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        info!("control channel TLS enabled");
        tokio::spawn(control::run_tls_accept_loop(control_listener, acceptor, plane.clone()))
    } else {
        tokio::spawn(control::run_plain_accept_loop(control_listener, plane.clone()))
    };

    let sweeper_task = tokio::spawn(liveness::run_sweeper(
        liveness.clone(),
        routing.clone(),
        correlator.clone(),
        observer.clone(),
    ));

    let http_state = http::HttpState {
        routing: routing.clone(),
        correlator: correlator.clone(),
    };
    let router = http::build_router(http_state);
    let http_listener = TcpListener::bind(args.http_addr).await?;
    info!(addr = %args.http_addr, "public listener started");

    tokio::select! {
        res = axum::serve(http_listener, router) => {
            res?;
        }
        _ = control_task => {}
        _ = sweeper_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
