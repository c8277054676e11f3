//! Connection context
//!
//! One [`ConnectionContext`] exists per accepted client connection. It owns
//! the client/server addresses, the TLS negotiation state and the handle to
//! the proxy-wide services, and it is the only place outbound connections
//! are opened from.

mod promise;
mod stream;
mod tls;

pub use promise::Promise;
pub use stream::{with_prefix, AsyncStream, BoxedStream, Connector, PrefixedStream, TcpConnector};
pub use tls::{TlsContext, FORWARD, H2, HTTP_1_1};

use crate::address::Address;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::listener::ListenerManager;
use crate::master::ProxyMaster;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket state of a connection
#[derive(Debug, Clone, Default)]
pub struct WsContext {
    pub path: Option<String>,
}

/// Result of [`ConnectionContext::connect`]
pub enum Outbound {
    /// The current outbound connection already targets the address
    Reused,
    /// A new connection; any previous one must be dropped by the caller
    Opened(BoxedStream),
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reused => f.write_str("Reused"),
            Self::Opened(_) => f.write_str("Opened"),
        }
    }
}

#[derive(Default)]
struct ServerState {
    address: Option<Address>,
    active: bool,
}

struct ContextInner {
    id: u64,
    client_addr: Address,
    master: Arc<ProxyMaster>,
    tls: TlsContext,
    ws: Mutex<WsContext>,
    server: Mutex<ServerState>,
}

/// Shared handle to one client connection's state. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionContext {
    pub fn new(client_addr: Address, master: Arc<ProxyMaster>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                client_addr,
                master,
                tls: TlsContext::new(),
                ws: Mutex::new(WsContext::default()),
                server: Mutex::new(ServerState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn client_addr(&self) -> &Address {
        &self.inner.client_addr
    }

    pub fn server_addr(&self) -> Option<Address> {
        lock(&self.inner.server).address.clone()
    }

    /// Record the destination without connecting (SNI known, connection
    /// opened elsewhere).
    pub fn set_server_addr(&self, address: Address) {
        lock(&self.inner.server).address = Some(address);
    }

    pub fn master(&self) -> &Arc<ProxyMaster> {
        &self.inner.master
    }

    pub fn config(&self) -> &ProxyConfig {
        self.inner.master.config()
    }

    pub fn listener(&self) -> &ListenerManager {
        self.inner.master.listener()
    }

    pub fn tls_ctx(&self) -> &TlsContext {
        &self.inner.tls
    }

    pub fn ws_ctx(&self) -> WsContext {
        lock(&self.inner.ws).clone()
    }

    pub fn set_ws_path(&self, path: impl Into<String>) {
        lock(&self.inner.ws).path = Some(path.into());
    }

    pub fn is_server_active(&self) -> bool {
        lock(&self.inner.server).active
    }

    /// Mark the outbound connection as gone so the next `connect` opens a
    /// new one.
    pub fn server_closed(&self) {
        lock(&self.inner.server).active = false;
    }

    /// Connect to `address`.
    ///
    /// An active connection to the same address is reused. Otherwise a new
    /// connection is opened and the ALPN promises are replaced so nothing
    /// negotiated for a previous destination leaks into this one. On
    /// failure the caller is responsible for closing the client side.
    pub async fn connect(&self, address: Address) -> Result<Outbound> {
        let replaced = {
            let mut server = lock(&self.inner.server);
            if server.active && server.address.as_ref() == Some(&address) {
                return Ok(Outbound::Reused);
            }
            let replaced = server.active;
            server.address = Some(address.clone());
            server.active = false;
            replaced
        };

        if replaced {
            debug!("{} : closing previous server connection", self);
        }
        self.inner.tls.reset_negotiation();
        debug!("{} : connecting", self);

        let stream = self
            .inner
            .master
            .connector()
            .connect(&address)
            .await
            .map_err(|e| ProxyError::upstream_connect(&address, e))?;

        lock(&self.inner.server).active = true;
        self.listener().on_connect(self);
        Ok(Outbound::Opened(stream))
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_addr() {
            Some(server) => write!(
                f,
                "[Client ({})] <=> [Server ({})]",
                self.inner.client_addr, server
            ),
            None => write!(f, "[Client ({})] <=> [PROXY]", self.inner.client_addr),
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.inner.id)
            .field("client", &self.inner.client_addr)
            .field("server", &self.server_addr())
            .finish()
    }
}
