//! HTTP/1.1 proxying

pub mod codec;
mod engine;

pub use codec::{CodecError, MessageReader, MessageWriter};
pub use engine::Http1ProxyEngine;

use bytes::Bytes;
use http::{HeaderMap, Response};

/// One unit of an HTTP/1 response on its way to the client.
///
/// Responses leave the server as a single `Full` message. Listeners may
/// split it into `Head`, `Content`* and `LastContent` to stream a
/// rewritten body.
#[derive(Debug, Clone)]
pub enum HttpObject {
    /// Complete response
    Full(Response<Bytes>),
    /// Status line and headers; the body follows as `Content` objects
    Head(Response<()>),
    Content(Bytes),
    /// End of the body, with optional trailers
    LastContent(HeaderMap),
}

impl HttpObject {
    /// Whether this object completes a response
    pub fn is_last(&self) -> bool {
        matches!(self, Self::Full(_) | Self::LastContent(_))
    }
}
