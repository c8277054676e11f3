//! nitmproxy - intercepting proxy for HTTP/1.1, HTTP/2 and WebSocket
//!
//! nitmproxy sits between a client and the servers it talks to, terminates
//! TLS on both sides with certificates issued on the fly by its own CA, and
//! shows every request, response, WebSocket message and raw byte chunk to a
//! chain of listeners that may observe, rewrite or answer it.
//!
//! ## Features
//!
//! - **Front ends**: HTTP proxy (`CONNECT` and absolute URIs), SOCKS4/4a/5, transparent
//! - **TLS interception**: ALPN mirrored from the client to the server and back
//! - **HTTP/1.1**: pipelining with strict response ordering, WebSocket upgrades
//! - **HTTP/2**: per-stream interception with independent stream ids on each side
//! - **Unsafe upstream certificates**: accept, deny or ask the user
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nitmproxy::{ListenerStore, ProxyConfig, ProxyMaster, ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_env()?;
//!     let master = ProxyMaster::builder(config)
//!         .listeners(ListenerStore::new())
//!         .build()?;
//!
//!     ProxyServer::new(Arc::new(master))
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `frontend` - resolves the destination of a new connection
//! - `mitm` - CA, ClientHello sniffing, TLS negotiation, unsafe access
//! - `dispatcher` - picks the HTTP/1, HTTP/2 or raw forward engine
//! - `http1`, `http2`, `ws`, `forward` - the engines
//! - `listener` - interception hooks and their composition
//! - `server` - accept loop and per-connection orchestration

// Core types
pub mod address;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod master;

// Connection pipeline
pub mod dispatcher;
pub mod frontend;
pub mod mitm;
pub mod server;

// Engines
pub mod forward;
pub mod http1;
pub mod http2;
pub mod ws;

// Interception
pub mod listener;

// Re-export commonly used types

/// Addresses and configuration
pub use address::{Address, HttpUrl};
pub use config::{CliArgs, ProxyConfig, ProxyMode};

/// Errors
pub use error::{ProxyError, Result};

/// Connection state
pub use context::{ConnectionContext, Connector, TcpConnector, TlsContext};
pub use event::{ForwardEvent, HttpEvent};

/// Proxy services and server
pub use master::{ProxyMaster, ProxyMasterBuilder};
pub use server::{ConnectionOrchestrator, ProxyServer};

/// Protocol selection
pub use dispatcher::{Protocol, ProtocolDetector};

/// Interception
pub use http1::HttpObject;
pub use http2::{FullHttp2Response, Http2Frame, Http2FramesWrapper};
pub use listener::{HttpEventLogger, ListenerManager, ListenerStore, ProxyListener};

/// MITM types
pub use mitm::{
    CertificateAuthority, SimpleUnsafeAccessSupport, UnsafeAccess, UnsafeAccessSupport,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
