//! HTTP/1.1 message codec
//!
//! Reads complete (aggregated) requests and responses off a byte stream
//! and writes them back out. Bodies framed with `Transfer-Encoding:
//! chunked` are de-chunked on read and re-framed with `Content-Length`.

use crate::error::ProxyError;
use crate::http1::HttpObject;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid HTTP message: {0}")]
    Invalid(String),

    #[error("Headers too large (> {0} bytes)")]
    HeadersTooLarge(usize),

    #[error("Content too large: {size} bytes (limit: {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Connection closed in the middle of a message")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for CodecError {
    fn from(e: httparse::Error) -> Self {
        CodecError::Invalid(e.to_string())
    }
}

impl From<CodecError> for ProxyError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::TooLarge { size, limit } => ProxyError::ContentTooLarge { size, limit },
            CodecError::Io(e) => ProxyError::Io(e),
            CodecError::UnexpectedEof => {
                ProxyError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))
            }
            other => ProxyError::protocol(other.to_string()),
        }
    }
}

type CodecResult<T> = std::result::Result<T, CodecError>;

/// Status and method combinations that never carry a body
fn response_has_body(request_method: &Method, status: StatusCode) -> bool {
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    !(request_method == Method::CONNECT && status.is_success())
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> CodecResult<Option<usize>> {
    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| CodecError::Invalid("invalid content-length".to_string())),
        None => Ok(None),
    }
}

fn to_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn to_header_map(headers: &[httparse::Header<'_>]) -> CodecResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for h in headers {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| CodecError::Invalid(format!("invalid header name {}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| CodecError::Invalid(format!("invalid value for header {}", h.name)))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Body framing after de-chunking: the body length is authoritative.
fn reframe(headers: &mut HeaderMap, body_len: usize, had_body: bool) {
    if is_chunked(headers) {
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    } else if had_body && !headers.contains_key(header::CONTENT_LENGTH) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }
}

/// Buffered reader of complete HTTP/1 messages
pub struct MessageReader<R> {
    stream: R,
    buf: BytesMut,
    max_content_length: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(stream: R, max_content_length: usize) -> Self {
        Self::with_buffer(stream, BytesMut::with_capacity(READ_BUFFER_SIZE), max_content_length)
    }

    /// Start with bytes already read off `stream`.
    pub fn with_buffer(stream: R, buf: BytesMut, max_content_length: usize) -> Self {
        Self {
            stream,
            buf,
            max_content_length,
        }
    }

    /// Stream and any bytes read past the last message
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.stream, self.buf)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Read more bytes into the buffer. Returns the number read, 0 on EOF.
    /// Cancel safe.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_BUFFER_SIZE);
        self.stream.read_buf(&mut self.buf).await
    }

    async fn fill_or_eof(&mut self) -> CodecResult<()> {
        if self.fill().await? == 0 {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(())
    }

    /// Next request, or `None` when the peer closed between messages.
    pub async fn read_request(&mut self) -> CodecResult<Option<Request<Bytes>>> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&self.buf)? {
                httparse::Status::Complete(head_len) => {
                    let method = Method::from_bytes(parsed.method.unwrap_or("GET").as_bytes())
                        .map_err(|e| CodecError::Invalid(e.to_string()))?;
                    let uri = parsed
                        .path
                        .unwrap_or("/")
                        .parse::<Uri>()
                        .map_err(|e| CodecError::Invalid(e.to_string()))?;
                    let version = to_version(parsed.version);
                    let mut header_map = to_header_map(parsed.headers)?;
                    self.buf.advance(head_len);

                    // Requests without framing have no body
                    let chunked = is_chunked(&header_map);
                    let length = content_length(&header_map)?;
                    let body = if chunked {
                        self.read_chunked_body().await?
                    } else if let Some(length) = length {
                        self.read_sized_body(length).await?
                    } else {
                        Bytes::new()
                    };
                    reframe(&mut header_map, body.len(), chunked);

                    let mut request = Request::new(body);
                    *request.method_mut() = method;
                    *request.uri_mut() = uri;
                    *request.version_mut() = version;
                    *request.headers_mut() = header_map;
                    return Ok(Some(request));
                }
                httparse::Status::Partial => {
                    if self.buf.len() > MAX_HEADER_SIZE {
                        return Err(CodecError::HeadersTooLarge(MAX_HEADER_SIZE));
                    }
                    if self.fill().await? == 0 {
                        return if self.buf.is_empty() {
                            Ok(None)
                        } else {
                            Err(CodecError::UnexpectedEof)
                        };
                    }
                }
            }
        }
    }

    /// Next response to a request made with `request_method`, or `None`
    /// when the peer closed between messages.
    pub async fn read_response(
        &mut self,
        request_method: &Method,
    ) -> CodecResult<Option<Response<Bytes>>> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut headers);
            match parsed.parse(&self.buf)? {
                httparse::Status::Complete(head_len) => {
                    let status = StatusCode::from_u16(parsed.code.unwrap_or(500))
                        .map_err(|e| CodecError::Invalid(e.to_string()))?;
                    let version = to_version(parsed.version);
                    let mut header_map = to_header_map(parsed.headers)?;
                    self.buf.advance(head_len);

                    let has_body = response_has_body(request_method, status);
                    let chunked = has_body && is_chunked(&header_map);
                    let body = if !has_body {
                        Bytes::new()
                    } else if chunked {
                        self.read_chunked_body().await?
                    } else if let Some(length) = content_length(&header_map)? {
                        self.read_sized_body(length).await?
                    } else {
                        self.read_until_eof().await?
                    };
                    if has_body {
                        reframe(&mut header_map, body.len(), true);
                    }

                    let mut response = Response::new(body);
                    *response.status_mut() = status;
                    *response.version_mut() = version;
                    *response.headers_mut() = header_map;
                    return Ok(Some(response));
                }
                httparse::Status::Partial => {
                    if self.buf.len() > MAX_HEADER_SIZE {
                        return Err(CodecError::HeadersTooLarge(MAX_HEADER_SIZE));
                    }
                    if self.fill().await? == 0 {
                        return if self.buf.is_empty() {
                            Ok(None)
                        } else {
                            Err(CodecError::UnexpectedEof)
                        };
                    }
                }
            }
        }
    }

    fn check_limit(&self, size: usize) -> CodecResult<()> {
        if size > self.max_content_length {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_content_length,
            });
        }
        Ok(())
    }

    async fn read_sized_body(&mut self, length: usize) -> CodecResult<Bytes> {
        self.check_limit(length)?;
        while self.buf.len() < length {
            self.fill_or_eof().await?;
        }
        Ok(self.buf.split_to(length).freeze())
    }

    async fn read_until_eof(&mut self) -> CodecResult<Bytes> {
        loop {
            self.check_limit(self.buf.len())?;
            if self.fill().await? == 0 {
                break;
            }
        }
        self.check_limit(self.buf.len())?;
        Ok(self.buf.split().freeze())
    }

    async fn read_line(&mut self) -> CodecResult<BytesMut> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_HEADER_SIZE {
                return Err(CodecError::HeadersTooLarge(MAX_HEADER_SIZE));
            }
            self.fill_or_eof().await?;
        }
    }

    async fn read_chunked_body(&mut self) -> CodecResult<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let line = std::str::from_utf8(&line)
                .map_err(|_| CodecError::Invalid("invalid chunk size encoding".to_string()))?;
            // Strip chunk extensions
            let size = line.split(';').next().unwrap_or(line).trim();
            let size = usize::from_str_radix(size, 16)
                .map_err(|_| CodecError::Invalid(format!("invalid chunk size {}", size)))?;

            if size == 0 {
                // Trailers are dropped; the aggregated message is re-framed
                while !self.read_line().await?.is_empty() {}
                return Ok(body.freeze());
            }

            let total = body.len().checked_add(size).ok_or(CodecError::TooLarge {
                size: usize::MAX,
                limit: self.max_content_length,
            })?;
            self.check_limit(total)?;
            let framed = size
                .checked_add(2)
                .ok_or_else(|| CodecError::Invalid(format!("invalid chunk size {:x}", size)))?;
            while self.buf.len() < framed {
                self.fill_or_eof().await?;
            }
            if &self.buf[size..framed] != b"\r\n" {
                return Err(CodecError::Invalid("missing CRLF after chunk data".to_string()));
            }
            body.extend_from_slice(&self.buf[..size]);
            self.buf.advance(framed);
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn encode_headers(out: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

pub fn encode_request_head<B>(request: &Request<B>) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    let target = if request.method() == Method::CONNECT {
        request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| request.uri().to_string())
    } else {
        request.uri().to_string()
    };
    out.extend_from_slice(
        format!("{} {} {}\r\n", request.method(), target, version_str(request.version())).as_bytes(),
    );
    encode_headers(&mut out, request.headers());
    out
}

pub fn encode_response_head<B>(response: &Response<B>) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    let status = response.status();
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version_str(response.version()),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    encode_headers(&mut out, response.headers());
    out
}

/// Writes requests, responses and streamed response objects
pub struct MessageWriter<W> {
    stream: W,
    chunked: bool,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            chunked: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.stream
    }

    pub async fn write_request(&mut self, request: &Request<Bytes>) -> io::Result<()> {
        let mut out = encode_request_head(request);
        out.extend_from_slice(request.body());
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }

    pub async fn write_response(&mut self, response: &Response<Bytes>) -> io::Result<()> {
        let mut out = encode_response_head(response);
        out.extend_from_slice(response.body());
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }

    /// Write one response object. A `Head` without `Content-Length` switches
    /// the body to chunked framing until `LastContent`.
    pub async fn write_object(&mut self, object: HttpObject) -> io::Result<()> {
        match object {
            HttpObject::Full(response) => self.write_response(&response).await,
            HttpObject::Head(mut head) => {
                self.chunked = !head.headers().contains_key(header::CONTENT_LENGTH)
                    && response_has_body(&Method::GET, head.status());
                if self.chunked {
                    head.headers_mut().insert(
                        header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                }
                self.stream.write_all(&encode_response_head(&head)).await?;
                self.stream.flush().await
            }
            HttpObject::Content(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                if self.chunked {
                    self.stream
                        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                        .await?;
                    self.stream.write_all(&data).await?;
                    self.stream.write_all(b"\r\n").await?;
                } else {
                    self.stream.write_all(&data).await?;
                }
                self.stream.flush().await
            }
            HttpObject::LastContent(trailers) => {
                if self.chunked {
                    let mut out = BytesMut::from(&b"0\r\n"[..]);
                    encode_headers(&mut out, &trailers);
                    self.stream.write_all(&out).await?;
                    self.chunked = false;
                }
                self.stream.flush().await
            }
        }
    }
}
