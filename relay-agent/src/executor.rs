//! Executes a forwarded request against the local HTTP service.
//!
//! Dials `local_addr`, composes a raw HTTP/1.1 request line by line, and
//! parses the response the same way: scan for the `\r\n\r\n` header
//! terminator, split each header line on the first colon, and read the
//! body out to `Content-Length` (or until EOF when absent). These three
//! helpers are carried over near-verbatim from the original client's
//! hand-rolled HTTP parsing; only the status line parser is widened to
//! capture the reason phrase.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use relay_protocol::{body, Message, RequestData, ResponseData};

/// Requests larger than this are read in chunks and reported via `Progress`.
const PROGRESS_CHUNK_BYTES: usize = 256 * 1024;
const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("could not reach the local service: {0}")]
    Dial(#[from] std::io::Error),
    #[error("dial to the local service timed out")]
    DialTimeout,
    #[error("the local service's response was not valid HTTP")]
    MalformedResponse,
}

/// Executes one forwarded request, emitting `Progress` messages on
/// `progress` as the response body is read for large payloads.
pub async fn execute(
    local_addr: SocketAddr,
    request_id: &str,
    request: &RequestData,
    progress: &mpsc::Sender<Message>,
) -> Result<ResponseData, ExecutorError> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(local_addr))
        .await
        .map_err(|_| ExecutorError::DialTimeout)??;

    let request_body = decode_request_body(request);
    let wire = compose_request(local_addr, request, &request_body);
    stream.write_all(&wire).await?;

    let (status, headers, response_body) =
        read_response(&mut stream, request_id, progress).await?;

    let (is_binary, body_text) = body::encode(&headers, &response_body);
    Ok(ResponseData {
        status,
        headers,
        body: body_text,
        is_binary,
    })
}

fn decode_request_body(request: &RequestData) -> Vec<u8> {
    let is_binary = request
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case(body::BODY_ENCODING_HEADER) && v == "base64");
    body::decode(is_binary, &request.body)
}

fn compose_request(local_addr: SocketAddr, request: &RequestData, request_body: &[u8]) -> Vec<u8> {
    let mut wire = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        request.method, request.path, local_addr
    );
    for (key, value) in &request.headers {
        if key.eq_ignore_ascii_case(body::BODY_ENCODING_HEADER) {
            continue;
        }
        wire.push_str(&format!("{key}: {value}\r\n"));
    }
    if !request_body.is_empty() && !has_header(&request.headers, "content-length") {
        wire.push_str(&format!("Content-Length: {}\r\n", request_body.len()));
    }
    wire.push_str("Connection: close\r\n\r\n");
    let mut out = wire.into_bytes();
    out.extend_from_slice(request_body);
    out
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

async fn read_response(
    stream: &mut TcpStream,
    request_id: &str,
    progress: &mpsc::Sender<Message>,
) -> Result<(u16, Vec<(String, String)>, Vec<u8>), ExecutorError> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut header_end = None;

    loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if header_end.is_none() {
            header_end = find_header_end(&buf);
        }
        if header_end.is_some() || buf.len() > MAX_RESPONSE_BYTES {
            break;
        }
    }

    let hend = header_end.ok_or(ExecutorError::MalformedResponse)?;
    let header_bytes = &buf[..hend];
    let mut lines = header_bytes
        .split(|b| *b == b'\r' || *b == b'\n')
        .filter(|l| !l.is_empty());
    let status_line = lines.next().unwrap_or(&[]);
    let status = parse_status_code(status_line).ok_or(ExecutorError::MalformedResponse)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    for line in lines {
        if let Some((k, v)) = split_header_kv(line) {
            if k.eq_ignore_ascii_case("content-length") {
                content_length = v.trim().parse::<usize>().ok();
            }
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let mut body = buf[hend + 4..].to_vec();
    let mut emitted_progress = 0usize;
    loop {
        if let Some(cl) = content_length {
            if body.len() >= cl {
                body.truncate(cl);
                break;
            }
        }
        if body.len() > emitted_progress + PROGRESS_CHUNK_BYTES {
            emitted_progress = body.len();
            let _ = progress
                .send(Message::Progress {
                    request_id: request_id.to_string(),
                    message: format!("received {emitted_progress} bytes"),
                    timestamp: None,
                })
                .await;
        }
        if body.len() > MAX_RESPONSE_BYTES {
            break;
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    Ok((status, headers, body))
}

pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    let pat = b"\r\n\r\n";
    buf.windows(4).position(|w| w == pat)
}

pub(crate) fn parse_status_code(line: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(line).ok()?;
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() >= 2 {
        parts[1].parse::<u16>().ok()
    } else {
        None
    }
}

pub(crate) fn split_header_kv(line: &[u8]) -> Option<(&str, &str)> {
    let s = std::str::from_utf8(line).ok()?;
    let mut iter = s.splitn(2, ':');
    let k = iter.next()?.trim();
    let v = iter.next()?.trim();
    Some((k, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_header_end_locates_the_blank_line() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let pos = find_header_end(buf).unwrap();
        assert_eq!(&buf[pos + 4..], b"hi");
    }

    #[test]
    fn parse_status_code_reads_the_second_token() {
        assert_eq!(parse_status_code(b"HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_code(b"garbage"), None);
    }

    #[test]
    fn split_header_kv_trims_both_sides() {
        let (k, v) = split_header_kv(b"Content-Type:  text/plain ").unwrap();
        assert_eq!(k, "Content-Type");
        assert_eq!(v, "text/plain");
    }

    #[test]
    fn compose_request_adds_a_content_length_for_a_nonempty_body() {
        let request = RequestData {
            method: "POST".into(),
            path: "/submit".into(),
            headers: vec![],
            body: String::new(),
        };
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let wire = compose_request(addr, &request, b"hello");
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }
}
