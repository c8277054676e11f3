//! Content coding for intercepted response bodies

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::{HeaderMap, CONTENT_ENCODING};
use std::io::{Read, Write};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

/// Content codings the proxy can undo and redo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            _ => None,
        }
    }

    /// Coding named by `content-encoding`. `identity`, unknown codings and
    /// stacked codings yield `None`, leaving the body untouched.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?;
        if value.contains(',') {
            return None;
        }
        Self::from_name(value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
        }
    }

    /// Undo the coding. Output beyond `limit` bytes is `ContentTooLarge`.
    pub fn decode(&self, body: &[u8], limit: usize) -> Result<Bytes> {
        let decoded = match self {
            Self::Gzip => read_bounded(GzDecoder::new(body), limit)?,
            Self::Deflate => {
                // Many servers send raw deflate despite the zlib framing
                // the standard requires.
                match read_bounded(ZlibDecoder::new(body), limit) {
                    Ok(decoded) => decoded,
                    Err(ProxyError::Io(_)) => read_bounded(DeflateDecoder::new(body), limit)?,
                    Err(e) => return Err(e),
                }
            }
            Self::Brotli => read_bounded(
                brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE),
                limit,
            )?,
        };
        if decoded.len() > limit {
            return Err(ProxyError::ContentTooLarge {
                size: decoded.len(),
                limit,
            });
        }
        Ok(Bytes::from(decoded))
    }

    pub fn encode(&self, body: &[u8]) -> Result<Bytes> {
        let encoded = match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Brotli => {
                let mut encoded = Vec::new();
                {
                    let mut writer = brotli::CompressorWriter::new(
                        &mut encoded,
                        BROTLI_BUFFER_SIZE,
                        BROTLI_QUALITY,
                        BROTLI_WINDOW,
                    );
                    writer.write_all(body)?;
                    writer.flush()?;
                }
                encoded
            }
        };
        Ok(Bytes::from(encoded))
    }
}

/// At most `limit + 1` bytes of `reader`, so overflow is detectable
fn read_bounded<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    Ok(out)
}

/// Decode `body` if `headers` name a supported coding. Returns the coding
/// that was undone so the caller can redo it.
pub fn decode_body(
    headers: &HeaderMap,
    body: &Bytes,
    limit: usize,
) -> Result<(Option<ContentEncoding>, Bytes)> {
    match ContentEncoding::from_headers(headers) {
        Some(encoding) => {
            let decoded = encoding.decode(body, limit).map_err(|e| match e {
                ProxyError::ContentTooLarge { .. } => e,
                e => ProxyError::protocol(format!("undecodable {} body: {}", encoding.name(), e)),
            })?;
            Ok((Some(encoding), decoded))
        }
        None => Ok((None, body.clone())),
    }
}
