//! ClientHello sniffing
//!
//! Reads the first TLS handshake message off a client stream without
//! consuming it for good: every byte read is returned so it can be replayed
//! into the real TLS acceptor.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const ALPN_EXTENSION: u16 = 0x0010;
const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16384 + 2048;
const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientHelloError {
    #[error("Not a TLS handshake record")]
    NotHandshake,

    #[error("Invalid TLS version")]
    InvalidTlsVersion,

    #[error("Not a ClientHello message")]
    NotClientHello,

    #[error("Invalid server name extension")]
    InvalidSni,

    #[error("Invalid ALPN extension")]
    InvalidAlpn,

    #[error("Message truncated")]
    Truncated,
}

/// Fields of a ClientHello the proxy acts on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
}

/// True when `prefix` starts a TLS handshake record.
pub fn is_tls_handshake(prefix: &[u8]) -> bool {
    prefix.len() >= 2 && prefix[0] == TLS_HANDSHAKE && prefix[1] == TLS_VERSION_MAJOR
}

/// Outcome of sniffing a client stream
#[derive(Debug)]
pub struct Sniffed {
    /// Every byte consumed from the stream, to be replayed
    pub consumed: Vec<u8>,
    /// `None` when the stream is not TLS
    pub hello: Option<ClientHello>,
}

/// Read enough of `stream` to decide whether it carries TLS and, if so,
/// parse the ClientHello. A stream that closes before sending anything
/// yields an empty, non-TLS result.
pub async fn sniff<S>(stream: &mut S, limit: Duration) -> std::io::Result<Sniffed>
where
    S: AsyncRead + Unpin,
{
    let mut consumed = Vec::with_capacity(1024);
    timeout(limit, read_hello(stream, &mut consumed))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ClientHello timeout"))?
        .map(|hello| Sniffed { consumed, hello })
}

async fn read_hello<S>(stream: &mut S, consumed: &mut Vec<u8>) -> std::io::Result<Option<ClientHello>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    if stream.read(&mut buf).await? == 0 {
        return Ok(None);
    }
    consumed.push(buf[0]);
    if buf[0] != TLS_HANDSHAKE {
        return Ok(None);
    }

    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0] = buf[0];
    read_exact_into(stream, &mut header[1..], consumed).await?;

    // Collect handshake bytes across records until the ClientHello is whole
    let mut handshake = Vec::new();
    loop {
        if header[0] != TLS_HANDSHAKE || header[1] != TLS_VERSION_MAJOR {
            return Ok(None);
        }

        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            debug!(record_len, "Invalid TLS record length");
            return Ok(None);
        }

        let mut payload = vec![0u8; record_len];
        read_exact_into(stream, &mut payload, consumed).await?;
        handshake.extend_from_slice(&payload);

        if handshake.len() >= 4 {
            let needed = 4 + u24(&handshake[1..4]);
            if handshake.len() >= needed || needed > MAX_HANDSHAKE_LEN {
                break;
            }
        }

        read_exact_into(stream, &mut header, consumed).await?;
    }

    match parse_handshake(&handshake) {
        Ok(hello) => Ok(Some(hello)),
        Err(e) => {
            debug!(error = %e, "Unparseable ClientHello");
            Ok(Some(ClientHello::default()))
        }
    }
}

async fn read_exact_into<S>(stream: &mut S, buf: &mut [u8], consumed: &mut Vec<u8>) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }
    stream.read_exact(buf).await?;
    consumed.extend_from_slice(buf);
    Ok(())
}

fn u16_at(data: &[u8], pos: usize) -> Result<usize, ClientHelloError> {
    data.get(pos..pos + 2)
        .map(|b| ((b[0] as usize) << 8) | b[1] as usize)
        .ok_or(ClientHelloError::Truncated)
}

fn u24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}

/// Parse a complete TLS record holding a ClientHello.
pub fn parse_record(record: &[u8]) -> Result<ClientHello, ClientHelloError> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(ClientHelloError::Truncated);
    }
    if record[0] != TLS_HANDSHAKE {
        return Err(ClientHelloError::NotHandshake);
    }
    if record[1] != TLS_VERSION_MAJOR {
        return Err(ClientHelloError::InvalidTlsVersion);
    }

    let record_len = u16_at(record, 3)?;
    let payload = record
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len)
        .ok_or(ClientHelloError::Truncated)?;
    parse_handshake(payload)
}

/// Parse a handshake message (type, 24-bit length, body).
pub fn parse_handshake(data: &[u8]) -> Result<ClientHello, ClientHelloError> {
    if data.len() < 4 {
        return Err(ClientHelloError::Truncated);
    }
    if data[0] != CLIENT_HELLO {
        return Err(ClientHelloError::NotClientHello);
    }

    let end = 4 + u24(&data[1..4]);
    if data.len() < end {
        return Err(ClientHelloError::Truncated);
    }

    // legacy_version + random
    let mut pos = 4 + 2 + 32;

    let session_id_len = *data.get(pos).ok_or(ClientHelloError::Truncated)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = u16_at(data, pos)?;
    pos += 2 + cipher_suites_len;

    let compression_len = *data.get(pos).ok_or(ClientHelloError::Truncated)? as usize;
    pos += 1 + compression_len;

    let mut hello = ClientHello::default();
    if pos == end {
        // No extensions at all
        return Ok(hello);
    }

    let extensions_len = u16_at(data, pos)?;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > end {
        return Err(ClientHelloError::Truncated);
    }

    while pos + 4 <= extensions_end {
        let extension_type = u16_at(data, pos)? as u16;
        let extension_len = u16_at(data, pos + 2)?;
        pos += 4;

        let body = data
            .get(pos..pos + extension_len)
            .filter(|_| pos + extension_len <= extensions_end)
            .ok_or(ClientHelloError::Truncated)?;

        match extension_type {
            SNI_EXTENSION => hello.server_name = parse_sni(body)?,
            ALPN_EXTENSION => hello.alpn_protocols = parse_alpn(body)?,
            _ => {}
        }
        pos += extension_len;
    }

    Ok(hello)
}

fn parse_sni(body: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let list_len = u16_at(body, 0).map_err(|_| ClientHelloError::InvalidSni)?;
    if list_len + 2 > body.len() {
        return Err(ClientHelloError::InvalidSni);
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = body[pos];
        let name_len = u16_at(body, pos + 1)?;
        pos += 3;

        let name = body
            .get(pos..pos + name_len)
            .ok_or(ClientHelloError::InvalidSni)?;
        if name_type == 0 {
            return std::str::from_utf8(name)
                .map(|s| Some(s.to_string()))
                .map_err(|_| ClientHelloError::InvalidSni);
        }
        pos += name_len;
    }

    Ok(None)
}

fn parse_alpn(body: &[u8]) -> Result<Vec<String>, ClientHelloError> {
    let list_len = u16_at(body, 0).map_err(|_| ClientHelloError::InvalidAlpn)?;
    let list = body
        .get(2..2 + list_len)
        .ok_or(ClientHelloError::InvalidAlpn)?;

    let mut protocols = Vec::new();
    let mut pos = 0;
    while pos < list.len() {
        let len = list[pos] as usize;
        let name = list
            .get(pos + 1..pos + 1 + len)
            .ok_or(ClientHelloError::InvalidAlpn)?;
        protocols.push(String::from_utf8_lossy(name).into_owned());
        pos += 1 + len;
    }

    Ok(protocols)
}
