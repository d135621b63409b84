//! Newline-delimited JSON framing over an arbitrary async byte stream.
//!
//! One [`Message`] per line. The stream is generic over
//! `AsyncRead + AsyncWrite + Unpin` so the same reader/writer pair works
//! over a plain `TcpStream` or a `tokio_rustls` TLS stream without
//! duplicating the framing logic.

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use crate::error::{Error, Result};
use crate::message::Message;

/// Frames larger than this are rejected before they are fully buffered.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Reads [`Message`]s one newline-terminated JSON line at a time.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Reads the next message, or `None` on a clean EOF between frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        self.line.clear();
        let mut limited = (&mut self.inner).take(MAX_FRAME_BYTES as u64 + 1);
        let bytes_read = limited.read_line(&mut self.line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if self.line.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(self.line.len(), MAX_FRAME_BYTES));
        }
        if !self.line.ends_with('\n') {
            return Err(Error::UnterminatedFrame);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            // Blank keep-alive lines are tolerated; ask the caller to read again.
            return Box::pin(self.read_message()).await;
        }
        let msg = serde_json::from_str(trimmed)
            .map_err(|e| Error::InvalidMessage(format!("{e}: {trimmed}")))?;
        Ok(Some(msg))
    }
}

/// Writes [`Message`]s as newline-terminated JSON lines.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let mut line =
            serde_json::to_string(msg).map_err(|e| Error::Protocol(e.to_string()))?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(line.len(), MAX_FRAME_BYTES));
        }
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// A bidirectional message stream, split into independent read/write halves
/// so a reader task and a writer task can own them separately.
pub struct MessageStream<S> {
    pub reader: MessageReader<ReadHalf<S>>,
    pub writer: MessageWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageStream<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read_half),
            writer: MessageWriter::new(write_half),
        }
    }

    pub fn into_parts(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}
