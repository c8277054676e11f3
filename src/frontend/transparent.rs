//! Transparent front end: the destination comes from the traffic itself

use super::Handoff;
use crate::address::Address;
use crate::context::{BoxedStream, ConnectionContext, Outbound};
use crate::error::{ProxyError, Result};
use crate::mitm::{ClientStart, TlsNegotiator};
use tracing::debug;

const DEFAULT_TLS_PORT: u16 = 443;

pub struct TransparentFrontend {
    ctx: ConnectionContext,
}

impl TransparentFrontend {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    /// TLS connections go to their SNI on port 443. Plaintext is left to
    /// the HTTP/1 engine, which connects by `Host` header.
    pub async fn accept(&self, client: BoxedStream) -> Result<Option<Handoff>> {
        match TlsNegotiator::new(self.ctx.clone()).detect(client).await? {
            ClientStart::Tls { stream, hello } => {
                let sni = hello
                    .server_name
                    .clone()
                    .ok_or_else(|| ProxyError::tls("transparent TLS connection without SNI"))?;
                let address = Address::new(sni, DEFAULT_TLS_PORT);
                debug!(target = %address, "{} : transparent TLS", self.ctx);
                let server = match self.ctx.connect(address).await? {
                    Outbound::Opened(server) => server,
                    Outbound::Reused => return Err(ProxyError::protocol("connection already open")),
                };
                Ok(Some(Handoff::Tls {
                    client: stream,
                    hello,
                    server,
                }))
            }
            ClientStart::Plain(stream) => Ok(Some(Handoff::Http { client: stream })),
        }
    }
}
