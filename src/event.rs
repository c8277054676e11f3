//! Telemetry events
//!
//! One [`HttpEvent`] per completed request/response exchange and one
//! [`ForwardEvent`] per raw forwarded connection. Both are assembled
//! incrementally while traffic flows and frozen by `build()`.

use crate::address::Address;
use crate::context::ConnectionContext;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Version};

/// A completed HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub struct HttpEvent {
    pub client: Address,
    pub server: Option<Address>,

    // request
    pub method: Method,
    pub version: Version,
    pub host: String,
    pub path: String,
    pub request_body_size: u64,
    pub request_time: DateTime<Utc>,

    // response
    pub status: Option<StatusCode>,
    pub content_type: Option<String>,
    pub response_body_size: u64,
    pub response_time: DateTime<Utc>,

    /// `response_time - request_time`, in milliseconds
    pub time_spent_ms: i64,
}

impl HttpEvent {
    pub fn builder(ctx: &ConnectionContext) -> HttpEventBuilder {
        HttpEventBuilder::new(ctx.client_addr().clone(), ctx.server_addr())
    }

    /// `host + path`, the way it is logged
    pub fn url(&self) -> String {
        format!("{}{}", self.host, self.path)
    }
}

/// Incremental [`HttpEvent`] assembly
#[derive(Debug, Clone)]
pub struct HttpEventBuilder {
    client: Address,
    server: Option<Address>,
    method: Method,
    version: Version,
    host: String,
    path: String,
    request_body_size: u64,
    request_time: Option<DateTime<Utc>>,
    status: Option<StatusCode>,
    content_type: Option<String>,
    response_body_size: u64,
    response_time: Option<DateTime<Utc>>,
}

impl HttpEventBuilder {
    pub fn new(client: Address, server: Option<Address>) -> Self {
        Self {
            client,
            server,
            method: Method::GET,
            version: Version::HTTP_11,
            host: String::new(),
            path: String::new(),
            request_body_size: 0,
            request_time: None,
            status: None,
            content_type: None,
            response_body_size: 0,
            response_time: None,
        }
    }

    pub fn server(&mut self, server: Option<Address>) -> &mut Self {
        self.server = server;
        self
    }

    pub fn method(&mut self, method: Method) -> &mut Self {
        self.method = method;
        self
    }

    pub fn version(&mut self, version: Version) -> &mut Self {
        self.version = version;
        self
    }

    pub fn host(&mut self, host: impl Into<String>) -> &mut Self {
        self.host = host.into();
        self
    }

    pub fn path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = path.into();
        self
    }

    pub fn request_body_size(&mut self, size: u64) -> &mut Self {
        self.request_body_size = size;
        self
    }

    pub fn add_request_body_size(&mut self, delta: u64) -> &mut Self {
        self.request_body_size += delta;
        self
    }

    pub fn request_time(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.request_time = Some(at);
        self
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self
    }

    /// Keep only the media type, dropping parameters such as `charset`.
    pub fn content_type(&mut self, content_type: Option<&str>) -> &mut Self {
        self.content_type = content_type
            .and_then(|value| value.split(';').next())
            .map(|media| media.trim().to_string())
            .filter(|media| !media.is_empty());
        self
    }

    /// Record status and content type from a response head.
    pub fn response_head(&mut self, status: StatusCode, headers: &HeaderMap) -> &mut Self {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        self.status(status).content_type(content_type)
    }

    pub fn response_body_size(&mut self, size: u64) -> &mut Self {
        self.response_body_size = size;
        self
    }

    pub fn add_response_body_size(&mut self, delta: u64) -> &mut Self {
        self.response_body_size += delta;
        self
    }

    pub fn response_time(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.response_time = Some(at);
        self
    }

    pub fn build(&self) -> HttpEvent {
        let request_time = self.request_time.unwrap_or_else(Utc::now);
        let response_time = self.response_time.unwrap_or(request_time);
        HttpEvent {
            client: self.client.clone(),
            server: self.server.clone(),
            method: self.method.clone(),
            version: self.version,
            host: self.host.clone(),
            path: self.path.clone(),
            request_body_size: self.request_body_size,
            request_time,
            status: self.status,
            content_type: self.content_type.clone(),
            response_body_size: self.response_body_size,
            response_time,
            time_spent_ms: (response_time - request_time).num_milliseconds(),
        }
    }
}

/// A raw forwarded connection
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardEvent {
    pub client: Address,
    pub server: Option<Address>,
    pub request_body_size: u64,
    pub request_time: Option<DateTime<Utc>>,
    pub response_body_size: u64,
    pub response_time: Option<DateTime<Utc>>,
    pub time_spent_ms: i64,
}

impl ForwardEvent {
    pub fn builder(ctx: &ConnectionContext) -> ForwardEventBuilder {
        ForwardEventBuilder {
            client: ctx.client_addr().clone(),
            server: ctx.server_addr(),
            request_body_size: 0,
            request_time: None,
            response_body_size: 0,
            response_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardEventBuilder {
    client: Address,
    server: Option<Address>,
    request_body_size: u64,
    request_time: Option<DateTime<Utc>>,
    response_body_size: u64,
    response_time: Option<DateTime<Utc>>,
}

impl ForwardEventBuilder {
    /// Count client bytes; the first chunk stamps the request time.
    pub fn add_request_body_size(&mut self, delta: u64) -> &mut Self {
        self.request_time.get_or_insert_with(Utc::now);
        self.request_body_size += delta;
        self
    }

    /// Count server bytes; the first chunk stamps the response time.
    pub fn add_response_body_size(&mut self, delta: u64) -> &mut Self {
        self.response_time.get_or_insert_with(Utc::now);
        self.response_body_size += delta;
        self
    }

    pub fn build(&self) -> ForwardEvent {
        let time_spent_ms = match (self.request_time, self.response_time) {
            (Some(request), Some(response)) => (response - request).num_milliseconds(),
            _ => 0,
        };
        ForwardEvent {
            client: self.client.clone(),
            server: self.server.clone(),
            request_body_size: self.request_body_size,
            request_time: self.request_time,
            response_body_size: self.response_body_size,
            response_time: self.response_time,
            time_spent_ms,
        }
    }
}
