//! Interception listeners
//!
//! A [`ProxyListener`] observes and may rewrite the traffic of every
//! connection. All hooks default to "no opinion" / pass-through, so a
//! listener only implements what it cares about. Listeners are shared
//! across connections and must be safe for concurrent use.
//!
//! Registered listeners are combined by [`ListenerManager`]:
//! - request hooks run in registration order, the first decision wins;
//! - response and close hooks run in reverse order, each feeding the next;
//! - notification hooks run in registration order.

mod logger;
mod manager;
mod store;

pub use logger::HttpEventLogger;
pub use manager::ListenerManager;
pub use store::ListenerStore;

use crate::context::ConnectionContext;
use crate::error::Result;
use crate::event::{ForwardEvent, HttpEvent};
use crate::http1::HttpObject;
use crate::http2::{FullHttp2Response, Http2Frame, Http2FramesWrapper, Http2Headers};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[async_trait]
#[allow(unused_variables)]
pub trait ProxyListener: Send + Sync + 'static {
    /// Client connection accepted
    fn on_init(&self, ctx: &ConnectionContext) {}

    /// Outbound connection established
    fn on_connect(&self, ctx: &ConnectionContext) {}

    /// Request/response exchange completed
    fn on_http_event(&self, ctx: &ConnectionContext, event: &HttpEvent) {}

    /// Full HTTP/1 request, before it is forwarded. The request may be
    /// modified in place; returning a response answers the client directly
    /// and skips the server.
    async fn on_http1_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Request<Bytes>,
    ) -> Result<Option<Response<Bytes>>> {
        Ok(None)
    }

    /// Each HTTP/1 response object on its way to the client, replaced by
    /// zero or more objects.
    fn on_http1_response(&self, ctx: &ConnectionContext, object: HttpObject) -> Vec<HttpObject> {
        vec![object]
    }

    /// Full HTTP/2 request, before it is forwarded. Same contract as
    /// [`ProxyListener::on_http1_request`], with a response frame sequence
    /// as the short-circuit answer.
    async fn on_http2_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Http2FramesWrapper,
    ) -> Result<Option<Http2FramesWrapper>> {
        Ok(None)
    }

    /// Whether a stream's response is buffered and handed to
    /// [`ProxyListener::on_http2_response`]. Asked once, on the first
    /// response HEADERS frame of the stream.
    fn intercept_http2_response(&self, ctx: &ConnectionContext, headers: &Http2Headers) -> bool {
        false
    }

    /// Buffered, decoded response of an intercepted stream. A returned
    /// response replaces it.
    async fn on_http2_response(
        &self,
        ctx: &ConnectionContext,
        response: &FullHttp2Response,
    ) -> Result<Option<FullHttp2Response>> {
        Ok(None)
    }

    /// Each streamed response frame of a stream that is not intercepted
    fn on_http2_response_frame(&self, ctx: &ConnectionContext, frame: Http2Frame) -> Vec<Http2Frame> {
        vec![frame]
    }

    fn on_ws_request(&self, ctx: &ConnectionContext, message: &Message) {}

    fn on_ws_response(&self, ctx: &ConnectionContext, message: &Message) {}

    /// Raw forwarded connection closed
    fn on_forward_event(&self, ctx: &ConnectionContext, event: &ForwardEvent) {}

    fn on_forward_request(&self, ctx: &ConnectionContext, data: &[u8]) {}

    fn on_forward_response(&self, ctx: &ConnectionContext, data: &[u8]) {}

    /// Connection closed
    fn close(&self, ctx: &ConnectionContext) {}
}
