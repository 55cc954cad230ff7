//! `GET <checkin_path>` for ESP8266httpUpdate clients
//!
//! Check-ins are answered straight on the socket. The response head is
//! written byte for byte, so the digest header reaches the device spelled
//! exactly as [`DIGEST_RESPONSE_HEADER`]. One request per connection.

use super::AppState;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use espota_core::checkin::OCTET_STREAM;
use espota_core::{Checkin, CheckinResponse, DIGEST_RESPONSE_HEADER};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Largest request head read before giving the connection to the router
pub const MAX_HEAD: usize = 16 * 1024;

/// Request line and headers of one HTTP/1 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Target without its query string
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a head ending in its blank line
    ///
    /// `None` for anything that is not a plain HTTP/1.x head. Header lines
    /// that are not UTF-8 are skipped.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let mut lines = raw
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let request_line = std::str::from_utf8(lines.next()?).ok()?;
        let mut parts = request_line.split(' ');
        let (method, target, version) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || method.is_empty() || !version.starts_with("HTTP/1.") {
            return None;
        }
        let path = target.split('?').next().unwrap_or(target);

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            // Folded continuation lines
            if line[0] == b' ' || line[0] == b'\t' {
                return None;
            }
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let (name, value) = line.split_once(':')?;
            if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
                return None;
            }
            headers.push((name.to_string(), value.trim_matches([' ', '\t']).to_string()));
        }

        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }
}

/// Offset just past the blank line that ends a request head
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read until `buf` holds a full request head
///
/// `None` when the peer stops sending first or the head outgrows
/// [`MAX_HEAD`]; whatever was read stays in `buf`.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> io::Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = head_end(buf) {
            return Ok(Some(end));
        }
        if buf.len() >= MAX_HEAD {
            return Ok(None);
        }
        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// Encode the response head and body
pub fn encode(response: &CheckinResponse) -> (Vec<u8>, Bytes) {
    let status = StatusCode::from_u16(response.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\nConnection: close\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
    );

    let body = match response {
        CheckinResponse::NotModified => Bytes::new(),
        CheckinResponse::Update { digest, content } => {
            head.push_str(&format!(
                "Content-Type: {}\r\nContent-Length: {}\r\n{}: {}\r\n",
                OCTET_STREAM,
                content.len(),
                DIGEST_RESPONSE_HEADER,
                digest.to_hex()
            ));
            content.clone()
        }
        CheckinResponse::BadRequest(reason) | CheckinResponse::InternalError(reason) => {
            head.push_str(&format!(
                "Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n",
                reason.len()
            ));
            Bytes::from(reason.clone())
        }
    };

    head.push_str("\r\n");
    (head.into_bytes(), body)
}

pub async fn write_response<W>(out: &mut W, response: &CheckinResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (head, body) = encode(response);
    out.write_all(&head).await?;
    out.write_all(&body).await?;
    out.flush().await?;
    out.shutdown().await
}

/// Decide, answer, then hand the audit trail to the sink
///
/// The trail is submitted after the last byte is written. An update that
/// could not be written in full is recorded as interrupted. The returned
/// handle is the submission; callers need not wait for it.
pub async fn respond<W>(
    mut out: W,
    peer: SocketAddr,
    state: &AppState,
    request: RequestHead,
) -> Option<JoinHandle<()>>
where
    W: AsyncWrite + Unpin,
{
    debug!("Check-in request from {}", peer);

    let handler = state.handler.clone();
    let decided = tokio::task::spawn_blocking(move || {
        handler.handle(
            request
                .headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    })
    .await;

    let Checkin { response, audit } = match decided {
        Ok(checkin) => checkin,
        Err(e) => {
            error!("Check-in worker failed: {}", e);
            Checkin {
                response: CheckinResponse::InternalError("Could not fetch sketch".to_string()),
                audit: None,
            }
        }
    };

    let written = write_response(&mut out, &response).await;
    let mut trail = audit?;
    if let Err(e) = written {
        match response {
            CheckinResponse::Update { .. } => {
                warn!("Sending image to {} failed: {}", trail.device, e);
                trail = trail.interrupted(e);
            }
            _ => debug!("Answering {} failed: {}", peer, e),
        }
    }

    let sink = state.audit.clone();
    Some(tokio::task::spawn_blocking(move || trail.submit(&*sink)))
}
