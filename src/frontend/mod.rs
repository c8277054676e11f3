//! Proxy front ends
//!
//! A front end turns a freshly accepted client connection into a known
//! destination. It never looks past the point where the destination is
//! fixed: whatever the client sends next is handed to the TLS stage or to
//! an engine untouched.

mod http;
mod socks;
mod transparent;

pub use http::HttpFrontend;
pub use socks::SocksFrontend;
pub use transparent::TransparentFrontend;

use crate::config::ProxyMode;
use crate::context::{BoxedStream, ConnectionContext};
use crate::error::Result;
use crate::mitm::ClientHello;
use std::fmt;

/// Outcome of a front end
pub enum Handoff {
    /// Destination connected; the client may speak TLS or plaintext next
    Tunnel {
        client: BoxedStream,
        server: BoxedStream,
    },
    /// Destination connected from the SNI of an already read ClientHello
    Tls {
        client: BoxedStream,
        hello: ClientHello,
        server: BoxedStream,
    },
    /// Plaintext HTTP/1 where each request names its destination
    Http { client: BoxedStream },
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel { .. } => f.write_str("Tunnel"),
            Self::Tls { hello, .. } => f
                .debug_struct("Tls")
                .field("sni", &hello.server_name)
                .finish(),
            Self::Http { .. } => f.write_str("Http"),
        }
    }
}

/// Run the front end for the configured mode. `None` means the client went
/// away before naming a destination.
pub async fn accept(ctx: &ConnectionContext, client: BoxedStream) -> Result<Option<Handoff>> {
    match ctx.config().mode {
        ProxyMode::Http => HttpFrontend::new(ctx.clone()).accept(client).await,
        ProxyMode::Socks => SocksFrontend::new(ctx.clone()).accept(client).await,
        ProxyMode::Transparent => TransparentFrontend::new(ctx.clone()).accept(client).await,
    }
}
