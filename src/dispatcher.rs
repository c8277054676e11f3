//! Protocol selection
//!
//! Picks exactly one engine for a connection, from the negotiated ALPN
//! value or, on plaintext connections, from the first bytes the client
//! sent. Detection only peeks: every byte it reads is replayed into the
//! chosen engine, so nothing is processed twice or skipped.

use crate::context::{with_prefix, BoxedStream, ConnectionContext, H2, HTTP_1_1};
use crate::error::{ProxyError, Result};
use crate::forward::ForwardEngine;
use crate::http1::Http1ProxyEngine;
use crate::http2::Http2ProxyEngine;
use lazy_static::lazy_static;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;

/// Bytes inspected by the HTTP/1 detector
const MAX_DETECT_BYTES: usize = 100;

/// HTTP/2 connection preface (prior knowledge)
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

lazy_static! {
    static ref HTTP1_FIRST_LINE: Regex =
        Regex::new(r"^[A-Z]+\s\S+\sHTTP/1\.1$").expect("request line pattern");
}

/// Engine selected for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    /// Raw byte relay
    Forward,
}

impl Protocol {
    /// `http/1.1` (or nothing) selects HTTP/1, `h2` HTTP/2, anything else
    /// the raw relay
    pub fn from_alpn(alpn: &str) -> Self {
        match alpn {
            "" | HTTP_1_1 => Self::Http1,
            H2 => Self::Http2,
            _ => Self::Forward,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http1 => "http/1.1",
            Self::Http2 => "h2",
            Self::Forward => "forward",
        };
        f.write_str(name)
    }
}

/// Plaintext protocol detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolDetector {
    /// `METHOD target HTTP/1.1` request line
    Http1,
    /// HTTP/2 connection preface
    Http2,
}

impl ProtocolDetector {
    pub fn detect(&self, prefix: &[u8]) -> Option<Protocol> {
        match self {
            Self::Http1 if detect_http1(prefix) => Some(Protocol::Http1),
            Self::Http2 if prefix.starts_with(H2_PREFACE) => Some(Protocol::Http2),
            _ => None,
        }
    }
}

/// True when `prefix` starts with an HTTP/1.1 request line. Only the first
/// `MAX_DETECT_BYTES` bytes up to the first CR are considered.
pub fn detect_http1(prefix: &[u8]) -> bool {
    let window = &prefix[..prefix.len().min(MAX_DETECT_BYTES)];
    let line = match window.iter().position(|&b| b == b'\r') {
        Some(end) => &window[..end],
        None => window,
    };
    !line.is_empty() && HTTP1_FIRST_LINE.is_match(line)
}

/// Read the start of a plaintext client stream and run the configured
/// detectors over it. No match selects the raw relay.
pub async fn detect(ctx: &ConnectionContext, mut client: BoxedStream) -> Result<(Protocol, BoxedStream)> {
    let mut prefix = Vec::with_capacity(MAX_DETECT_BYTES);
    let read = async {
        let mut chunk = [0u8; MAX_DETECT_BYTES];
        loop {
            let n = client.read(&mut chunk[..MAX_DETECT_BYTES - prefix.len()]).await?;
            if n == 0 {
                break;
            }
            prefix.extend_from_slice(&chunk[..n]);
            let complete_line = prefix.contains(&b'\r');
            let complete_preface = prefix.len() >= H2_PREFACE.len();
            if prefix.len() >= MAX_DETECT_BYTES || (complete_line && complete_preface) {
                break;
            }
            if complete_line && !H2_PREFACE.starts_with(&prefix) {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    };
    timeout(ctx.config().connect_timeout(), read)
        .await
        .map_err(|_| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "protocol detection timeout")))??;

    let protocol = ctx
        .config()
        .detectors
        .iter()
        .find_map(|detector| detector.detect(&prefix))
        .unwrap_or(Protocol::Forward);
    debug!(protocol = %protocol, "{} : plaintext protocol detected", ctx);
    Ok((protocol, with_prefix(prefix, client)))
}

/// Hand both legs to the engine for `protocol` and run it to completion.
/// HTTP/1 may start without an outbound connection and open one per
/// request; the other engines need one.
pub async fn dispatch(
    ctx: &ConnectionContext,
    protocol: Protocol,
    client: BoxedStream,
    server: Option<BoxedStream>,
) -> Result<()> {
    debug!(protocol = %protocol, "{} : dispatching", ctx);
    match (protocol, server) {
        (Protocol::Http1, server) => Http1ProxyEngine::new(ctx.clone()).run(client, server).await,
        (Protocol::Http2, Some(server)) => Http2ProxyEngine::new(ctx.clone()).run(client, server).await,
        (Protocol::Forward, Some(server)) => ForwardEngine::new(ctx.clone()).run(client, server).await,
        (protocol, None) => Err(ProxyError::protocol(format!(
            "{} requires an outbound connection",
            protocol
        ))),
    }
}
