//! HTTP proxy front end (`CONNECT` tunnels and absolute-URI requests)

use super::Handoff;
use crate::address::Address;
use crate::context::{with_prefix, BoxedStream, ConnectionContext, Outbound};
use crate::error::{ProxyError, Result};
use crate::http1::codec::{encode_request_head, encode_response_head, MessageReader};
use bytes::BytesMut;
use http::{Method, Request, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DEFAULT_TUNNEL_PORT: u16 = 443;

pub struct HttpFrontend {
    ctx: ConnectionContext,
}

impl HttpFrontend {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    /// Read the first request. `CONNECT` opens the tunnel and answers 200;
    /// anything else is replayed into the HTTP/1 engine, which routes it by
    /// its absolute URI.
    pub async fn accept(&self, client: BoxedStream) -> Result<Option<Handoff>> {
        let mut reader = MessageReader::new(client, self.ctx.config().max_content_length);
        let Some(request) = reader.read_request().await? else {
            debug!("{} : client closed before the first request", self.ctx);
            return Ok(None);
        };
        let (client, leftover) = reader.into_parts();

        if request.method() == Method::CONNECT {
            return self.tunnel(request, client, leftover).await.map(Some);
        }

        let mut replay = encode_request_head(&request);
        replay.extend_from_slice(request.body());
        replay.extend_from_slice(&leftover);
        Ok(Some(Handoff::Http {
            client: with_prefix(replay.freeze(), client),
        }))
    }

    async fn tunnel(
        &self,
        request: Request<bytes::Bytes>,
        mut client: BoxedStream,
        leftover: BytesMut,
    ) -> Result<Handoff> {
        let target = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::InvalidAddress(request.uri().to_string()))?;
        let address = Address::resolve_with_default(&target, DEFAULT_TUNNEL_PORT)?;
        debug!(target = %address, "{} : CONNECT", self.ctx);

        let server = match self.ctx.connect(address).await? {
            Outbound::Opened(stream) => stream,
            Outbound::Reused => return Err(ProxyError::protocol("CONNECT on an open tunnel")),
        };

        let mut established = Response::new(());
        *established.status_mut() = StatusCode::OK;
        *established.version_mut() = request.version();
        client.write_all(&encode_response_head(&established)).await?;
        client.flush().await?;

        Ok(Handoff::Tunnel {
            client: with_prefix(leftover.freeze(), client),
            server,
        })
    }
}
