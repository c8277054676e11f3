//! Built-in telemetry listener

use crate::context::ConnectionContext;
use crate::event::{ForwardEvent, HttpEvent};
use crate::listener::ProxyListener;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, enabled, info, trace, Level};

/// Logs every completed exchange, WebSocket message and forward span
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpEventLogger;

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

impl HttpEventLogger {
    fn log_ws(ctx: &ConnectionContext, direction: &str, message: &Message) {
        let path = ctx.ws_ctx().path.unwrap_or_default();
        if enabled!(Level::TRACE) {
            trace!(
                "{} : ws {} {} {} {:?}",
                ctx,
                direction,
                path,
                message_kind(message),
                message
            );
        } else {
            debug!(
                "{} : ws {} {} {} ({} bytes)",
                ctx,
                direction,
                path,
                message_kind(message),
                message.len()
            );
        }
    }
}

impl ProxyListener for HttpEventLogger {
    fn on_http_event(&self, ctx: &ConnectionContext, event: &HttpEvent) {
        info!(
            method = %event.method,
            status = event.status.map(|s| s.as_u16()).unwrap_or(0),
            request_size = event.request_body_size,
            response_size = event.response_body_size,
            content_type = event.content_type.as_deref().unwrap_or("-"),
            time_spent_ms = event.time_spent_ms,
            "{} : {} {} {}",
            ctx,
            event.method,
            event.status.map(|s| s.as_u16()).unwrap_or(0),
            event.url()
        );
    }

    fn on_ws_request(&self, ctx: &ConnectionContext, message: &Message) {
        Self::log_ws(ctx, "=>", message);
    }

    fn on_ws_response(&self, ctx: &ConnectionContext, message: &Message) {
        Self::log_ws(ctx, "<=", message);
    }

    fn on_forward_event(&self, ctx: &ConnectionContext, event: &ForwardEvent) {
        debug!(
            request_size = event.request_body_size,
            response_size = event.response_body_size,
            time_spent_ms = event.time_spent_ms,
            "{} : forward closed",
            ctx
        );
    }
}
