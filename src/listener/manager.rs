//! Listener aggregation

use crate::context::ConnectionContext;
use crate::error::Result;
use crate::event::{ForwardEvent, HttpEvent};
use crate::http1::HttpObject;
use crate::http2::{FullHttp2Response, Http2Frame, Http2FramesWrapper, Http2Headers};
use crate::listener::{HttpEventLogger, ListenerStore, ProxyListener};
use bytes::Bytes;
use http::{Request, Response};
use std::fmt;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Combines the registered listeners into one. [`HttpEventLogger`] always
/// runs first.
#[derive(Clone)]
pub struct ListenerManager {
    listeners: Arc<Vec<Arc<dyn ProxyListener>>>,
}

impl ListenerManager {
    pub fn new(store: &ListenerStore) -> Self {
        let mut listeners: Vec<Arc<dyn ProxyListener>> = vec![Arc::new(HttpEventLogger)];
        listeners.extend(store.listeners());
        Self {
            listeners: Arc::new(listeners),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn forward(&self) -> impl Iterator<Item = &Arc<dyn ProxyListener>> {
        self.listeners.iter()
    }

    fn reverse(&self) -> impl Iterator<Item = &Arc<dyn ProxyListener>> {
        self.listeners.iter().rev()
    }

    /// First non-empty decision, logging failed hooks as "no opinion"
    fn first_wins<T>(
        ctx: &ConnectionContext,
        hook: &str,
        decision: &mut Option<T>,
        result: Result<Option<T>>,
    ) {
        match result {
            Ok(Some(value)) if decision.is_none() => *decision = Some(value),
            Ok(_) => {}
            Err(e) => warn!("{} : {} listener failed: {}", ctx, hook, e),
        }
    }

    pub fn on_init(&self, ctx: &ConnectionContext) {
        self.forward().for_each(|l| l.on_init(ctx));
    }

    pub fn on_connect(&self, ctx: &ConnectionContext) {
        self.forward().for_each(|l| l.on_connect(ctx));
    }

    pub fn on_http_event(&self, ctx: &ConnectionContext, event: &HttpEvent) {
        self.forward().for_each(|l| l.on_http_event(ctx, event));
    }

    pub async fn on_http1_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Request<Bytes>,
    ) -> Option<Response<Bytes>> {
        let mut decision = None;
        for listener in self.forward() {
            let result = listener.on_http1_request(ctx, request).await;
            Self::first_wins(ctx, "http1 request", &mut decision, result);
        }
        decision
    }

    pub fn on_http1_response(&self, ctx: &ConnectionContext, object: HttpObject) -> Vec<HttpObject> {
        self.reverse().fold(vec![object], |objects, listener| {
            objects
                .into_iter()
                .flat_map(|object| listener.on_http1_response(ctx, object))
                .collect()
        })
    }

    pub async fn on_http2_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Http2FramesWrapper,
    ) -> Option<Http2FramesWrapper> {
        let mut decision = None;
        for listener in self.forward() {
            let result = listener.on_http2_request(ctx, request).await;
            Self::first_wins(ctx, "http2 request", &mut decision, result);
        }
        decision
    }

    /// True if any listener wants the response; every listener is asked.
    pub fn intercept_http2_response(&self, ctx: &ConnectionContext, headers: &Http2Headers) -> bool {
        self.forward()
            .any(|listener| listener.intercept_http2_response(ctx, headers))
    }

    pub async fn on_http2_response(
        &self,
        ctx: &ConnectionContext,
        response: &FullHttp2Response,
    ) -> Option<FullHttp2Response> {
        let mut decision = None;
        for listener in self.forward() {
            let result = listener.on_http2_response(ctx, response).await;
            Self::first_wins(ctx, "http2 response", &mut decision, result);
        }
        decision
    }

    pub fn on_http2_response_frame(&self, ctx: &ConnectionContext, frame: Http2Frame) -> Vec<Http2Frame> {
        self.reverse().fold(vec![frame], |frames, listener| {
            frames
                .into_iter()
                .flat_map(|frame| listener.on_http2_response_frame(ctx, frame))
                .collect()
        })
    }

    pub fn on_ws_request(&self, ctx: &ConnectionContext, message: &Message) {
        self.forward().for_each(|l| l.on_ws_request(ctx, message));
    }

    pub fn on_ws_response(&self, ctx: &ConnectionContext, message: &Message) {
        self.forward().for_each(|l| l.on_ws_response(ctx, message));
    }

    pub fn on_forward_event(&self, ctx: &ConnectionContext, event: &ForwardEvent) {
        self.forward().for_each(|l| l.on_forward_event(ctx, event));
    }

    pub fn on_forward_request(&self, ctx: &ConnectionContext, data: &[u8]) {
        self.forward().for_each(|l| l.on_forward_request(ctx, data));
    }

    pub fn on_forward_response(&self, ctx: &ConnectionContext, data: &[u8]) {
        self.reverse().for_each(|l| l.on_forward_response(ctx, data));
    }

    pub fn close(&self, ctx: &ConnectionContext) {
        self.reverse().for_each(|l| l.close(ctx));
    }
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new(&ListenerStore::new())
    }
}

impl fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerManager")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
