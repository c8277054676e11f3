//! WebSocket relay after a successful upgrade

use crate::context::{BoxedStream, ConnectionContext};
use crate::error::{ProxyError, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

fn ws_error(e: WsError) -> ProxyError {
    ProxyError::WebSocket(e.to_string())
}

/// Errors that just mean the peer already finished the close handshake
fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

/// One upgraded connection. Bytes already read past the 101 exchange are
/// handed over so no frame is lost.
pub struct WsUpgrade {
    pub client: BoxedStream,
    pub client_leftover: Vec<u8>,
    pub server: BoxedStream,
    pub server_leftover: Vec<u8>,
}

/// Relay messages until either side closes. The proxy is the server toward
/// the client and the client toward the origin.
pub async fn relay(ctx: &ConnectionContext, upgrade: WsUpgrade) -> Result<()> {
    let client =
        WebSocketStream::from_partially_read(upgrade.client, upgrade.client_leftover, Role::Server, None)
            .await;
    let server =
        WebSocketStream::from_partially_read(upgrade.server, upgrade.server_leftover, Role::Client, None)
            .await;
    debug!("{} : websocket relay started", ctx);

    let (mut client_tx, mut client_rx) = client.split();
    let (mut server_tx, mut server_rx) = server.split();
    let listener = ctx.listener();

    let result = loop {
        tokio::select! {
            message = client_rx.next() => {
                let Some(message) = message else { break Ok(()) };
                let message = match message {
                    Ok(message) => message,
                    Err(e) if is_closed(&e) => break Ok(()),
                    Err(e) => break Err(ws_error(e)),
                };
                listener.on_ws_request(ctx, &message);
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = server_tx.send(message).await {
                    break if is_closed(&e) { Ok(()) } else { Err(ws_error(e)) };
                }
                if closing {
                    debug!("{} : websocket closed by client", ctx);
                }
            }
            message = server_rx.next() => {
                let Some(message) = message else { break Ok(()) };
                let message = match message {
                    Ok(message) => message,
                    Err(e) if is_closed(&e) => break Ok(()),
                    Err(e) => break Err(ws_error(e)),
                };
                listener.on_ws_response(ctx, &message);
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = client_tx.send(message).await {
                    break if is_closed(&e) { Ok(()) } else { Err(ws_error(e)) };
                }
                if closing {
                    debug!("{} : websocket closed by server", ctx);
                }
            }
        }
    };

    let _ = client_tx.close().await;
    let _ = server_tx.close().await;
    ctx.server_closed();
    result
}
