//! Error types shared by the tunnel server and agent.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {0} bytes exceeds the {1} byte frame limit")]
    FrameTooLarge(usize, usize),

    #[error("connection closed before a terminating newline was observed")]
    UnterminatedFrame,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("tls error: {0}")]
    Tls(String),
}
