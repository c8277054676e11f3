//! Accept loop and per-connection orchestration

use crate::address::Address;
use crate::context::{BoxedStream, ConnectionContext, HTTP_1_1};
use crate::dispatcher::{self, Protocol};
use crate::error::Result;
use crate::frontend::{self, Handoff};
use crate::master::ProxyMaster;
use crate::mitm::{ClientHello, ClientStart, TlsNegotiator};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Listens on the configured address and runs one
/// [`ConnectionOrchestrator`] task per accepted client.
pub struct ProxyServer {
    master: Arc<ProxyMaster>,
}

impl ProxyServer {
    pub fn new(master: Arc<ProxyMaster>) -> Self {
        Self { master }
    }

    /// Bind the configured address and serve until `shutdown` completes
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let bind_addr = self.master.config().listen_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(mode = ?self.master.config().mode, "Listening on {}", bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Serve an already bound listener until `shutdown` completes.
    /// Connections in flight keep running on their own tasks.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);
                            let orchestrator = ConnectionOrchestrator::new(Arc::clone(&self.master));
                            let client_addr = Address::new(peer_addr.ip().to_string(), peer_addr.port());
                            tokio::spawn(async move {
                                orchestrator.handle(Box::new(stream), client_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down server...");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Drives one client connection through front end, TLS stage and engine
pub struct ConnectionOrchestrator {
    master: Arc<ProxyMaster>,
}

impl ConnectionOrchestrator {
    pub fn new(master: Arc<ProxyMaster>) -> Self {
        Self { master }
    }

    /// Run the connection to completion. Errors are logged, never returned:
    /// a failing connection only ever closes itself.
    pub async fn handle(&self, client: BoxedStream, client_addr: Address) {
        let ctx = ConnectionContext::new(client_addr, Arc::clone(&self.master));
        ctx.listener().on_init(&ctx);

        match self.handle_connection(&ctx, client).await {
            Ok(()) => debug!("{} : connection finished", ctx),
            Err(e) if e.is_disconnect() => debug!("{} : peer disconnected: {}", ctx, e),
            Err(e) => warn!("{} : connection failed: {}", ctx, e),
        }

        ctx.server_closed();
        ctx.listener().close(&ctx);
    }

    pub async fn handle_connection(&self, ctx: &ConnectionContext, client: BoxedStream) -> Result<()> {
        let Some(handoff) = frontend::accept(ctx, client).await? else {
            return Ok(());
        };
        debug!(handoff = ?handoff, "{} : destination resolved", ctx);

        match handoff {
            Handoff::Tunnel { client, server } => {
                match TlsNegotiator::new(ctx.clone()).detect(client).await? {
                    ClientStart::Tls { stream, hello } => self.intercept(ctx, stream, &hello, server).await,
                    ClientStart::Plain(stream) => {
                        ctx.tls_ctx().disable_tls(HTTP_1_1);
                        let (protocol, client) = dispatcher::detect(ctx, stream).await?;
                        dispatcher::dispatch(ctx, protocol, client, Some(server)).await
                    }
                }
            }
            Handoff::Tls { client, hello, server } => self.intercept(ctx, client, &hello, server).await,
            Handoff::Http { client } => dispatcher::dispatch(ctx, Protocol::Http1, client, None).await,
        }
    }

    async fn intercept(
        &self,
        ctx: &ConnectionContext,
        client: BoxedStream,
        hello: &ClientHello,
        server: BoxedStream,
    ) -> Result<()> {
        let negotiated = TlsNegotiator::new(ctx.clone())
            .negotiate(client, hello, server)
            .await?;
        info!(protocol = %negotiated.protocol, "{} : TLS intercepted", ctx);
        let protocol = Protocol::from_alpn(&negotiated.protocol);
        dispatcher::dispatch(ctx, protocol, negotiated.client, Some(negotiated.server)).await
    }
}
