//! Dials the relay's control channel, optionally wrapped in TLS.
//!
//! [`AgentStream`] erases the plain/TLS distinction behind one type so
//! the rest of the agent only ever deals with `MessageStream<AgentStream>`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use relay_protocol::tls::{client_config, insecure_client_config};

pub enum AgentStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AgentStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials `addr`, wrapping the connection in TLS when requested. A plain
/// `client_config` (real root store) isn't wired up yet since loading
/// trust roots is a collaborator this agent takes as input, not something
/// it reads off disk itself; `insecure` is the only TLS path available
/// until that collaborator lands.
pub async fn dial(addr: SocketAddr, tls: bool, insecure: bool, sni: &str) -> anyhow::Result<AgentStream> {
    let tcp = TcpStream::connect(addr).await?;
    if !tls {
        return Ok(AgentStream::Plain(tcp));
    }

    let config = if insecure {
        insecure_client_config()
    } else {
        client_config(RootCertStore::empty())
    };
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| anyhow::anyhow!("invalid TLS server name: {sni}"))?;
    let tls_stream = connector.connect(server_name, tcp).await?;
    Ok(AgentStream::Tls(Box::new(tls_stream)))
}
