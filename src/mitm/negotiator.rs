//! TLS negotiation for one connection
//!
//! Client side: detect TLS, read the ClientHello (SNI and ALPN offer),
//! then, once the server side has settled on a protocol, issue a leaf
//! certificate and complete the handshake advertising exactly that
//! protocol. Server side: wait for the client's ALPN offer, mirror it in
//! the upstream ClientHello, verify the server certificate through the
//! unsafe access policy and publish the negotiated protocol.

use crate::context::{with_prefix, BoxedStream, ConnectionContext, FORWARD, HTTP_1_1};
use crate::error::{ProxyError, Result};
use crate::mitm::client_hello::{self, ClientHello};
use crate::mitm::tls_config::{self, LeafSource};
use crate::mitm::unsafe_access::{UnsafeAccess, UnsafeAccessVerifier};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// What the client opened the connection with
pub enum ClientStart {
    /// Not TLS; sniffed bytes are replayed
    Plain(BoxedStream),
    /// TLS; the ClientHello is replayed into the acceptor
    Tls {
        stream: BoxedStream,
        hello: ClientHello,
    },
}

/// Both legs after negotiation
pub struct Negotiated {
    pub client: BoxedStream,
    pub server: BoxedStream,
    pub protocol: String,
}

#[derive(Clone)]
pub struct TlsNegotiator {
    ctx: ConnectionContext,
}

impl TlsNegotiator {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    /// Read the start of the client stream and classify it
    pub async fn detect(&self, mut client: BoxedStream) -> Result<ClientStart> {
        let sniffed = client_hello::sniff(&mut client, self.ctx.config().connect_timeout()).await?;
        let stream = with_prefix(sniffed.consumed, client);
        Ok(match sniffed.hello {
            Some(hello) => {
                debug!(
                    sni = hello.server_name.as_deref().unwrap_or("-"),
                    alpn = ?hello.alpn_protocols,
                    "{} : ClientHello received",
                    self.ctx
                );
                ClientStart::Tls { stream, hello }
            }
            None => ClientStart::Plain(stream),
        })
    }

    /// Run both handshakes. The outbound connection must already be open;
    /// the client's ALPN offer is published first so the server side can
    /// mirror it.
    pub async fn negotiate(
        &self,
        client: BoxedStream,
        hello: &ClientHello,
        server: BoxedStream,
    ) -> Result<Negotiated> {
        let _ = self
            .ctx
            .tls_ctx()
            .protocols_promise()
            .resolve(hello.alpn_protocols.clone());

        let server = self.server_handshake(server).await?;
        let client = self.client_handshake(client, hello).await?;
        let protocol = self.ctx.tls_ctx().protocol()?;
        Ok(Negotiated {
            client,
            server,
            protocol,
        })
    }

    /// ALPN values offered upstream: the negotiated protocol when already
    /// known, else the client's offer, else `http/1.1`
    async fn upstream_alpn(&self) -> Result<Vec<String>> {
        let tls = self.ctx.tls_ctx();
        if let Ok(protocol) = tls.protocol() {
            return Ok(vec![protocol]);
        }
        let offered = tls.protocols_promise().wait().await?;
        if offered.is_empty() {
            Ok(vec![HTTP_1_1.to_string()])
        } else {
            Ok(offered)
        }
    }

    /// Protocol used when the server negotiated none
    fn fallback_protocol(&self) -> String {
        let tls = self.ctx.tls_ctx();
        if let Ok(protocol) = tls.protocol() {
            return protocol;
        }
        match tls.protocols() {
            Ok(offered) if offered.iter().any(|p| p == HTTP_1_1) => HTTP_1_1.to_string(),
            _ => FORWARD.to_string(),
        }
    }

    /// Server-facing handshake. Plaintext connections pass through with the
    /// protocol settled to HTTP/1.1.
    pub async fn server_handshake(&self, server: BoxedStream) -> Result<BoxedStream> {
        let tls = self.ctx.tls_ctx();
        if !tls.is_enabled() {
            tls.disable_tls(HTTP_1_1);
            return Ok(server);
        }

        let address = self
            .ctx
            .server_addr()
            .ok_or_else(|| ProxyError::protocol("server handshake without destination"))?;
        let alpn = self.upstream_alpn().await?;

        let config = self.ctx.config();
        let inner = match &config.trust_override {
            Some(verifier) => Arc::clone(verifier),
            None => tls_config::default_verifier()?,
        };
        let policy = if config.insecure {
            UnsafeAccess::Accept
        } else {
            config.unsafe_access
        };
        let verifier = UnsafeAccessVerifier::new(
            inner,
            policy,
            self.ctx.master().unsafe_access_support(),
            self.ctx.clone(),
        );
        let upstream = tls_config::upstream(Arc::new(verifier), &config.tls_protocols, &alpn)?;

        let server_name = tls_config::server_name(address.host())?;
        let stream = TlsConnector::from(upstream)
            .connect(server_name, server)
            .await
            .map_err(|e| ProxyError::tls_handshake(address.host(), e))?;

        let negotiated = stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        let protocol = negotiated.unwrap_or_else(|| self.fallback_protocol());
        debug!(alpn = ?alpn, protocol = %protocol, "{} : server handshake done", self.ctx);

        if !tls.is_negotiated() {
            tls.protocol_promise().resolve(protocol)?;
        }
        Ok(Box::new(stream))
    }

    /// Client-facing handshake, advertising only the protocol the server
    /// side settled on
    pub async fn client_handshake(&self, client: BoxedStream, hello: &ClientHello) -> Result<BoxedStream> {
        let protocol = self.ctx.tls_ctx().protocol_promise().wait().await?;
        let alpn = if protocol == FORWARD {
            Vec::new()
        } else {
            vec![protocol]
        };

        let host = match &hello.server_name {
            Some(name) => name.clone(),
            None => self
                .ctx
                .server_addr()
                .map(|a| a.host().to_string())
                .ok_or_else(|| ProxyError::protocol("no SNI and no destination"))?,
        };

        let config = self.ctx.config();
        let server_config = match &config.cert_resolver_override {
            Some(resolver) => tls_config::client_facing(
                LeafSource::Resolver(Arc::clone(resolver)),
                &config.tls_protocols,
                &alpn,
            )?,
            None => {
                let cert = self.ctx.master().authority().get_cert(&host).await?;
                tls_config::client_facing(LeafSource::Issued(&cert), &config.tls_protocols, &alpn)?
            }
        };

        let stream = TlsAcceptor::from(server_config)
            .accept(client)
            .await
            .map_err(|e| ProxyError::tls_handshake(&host, e))?;
        debug!(host = %host, "{} : client handshake done", self.ctx);
        Ok(Box::new(stream))
    }
}
