//! Shared fixtures: in-memory origins, a recording listener and a proxy
//! connection driven over a duplex pipe.

#![allow(dead_code)]

use async_trait::async_trait;
use nitmproxy::context::{BoxedStream, Connector};
use nitmproxy::{
    Address, CertificateAuthority, ConnectionContext, ConnectionOrchestrator, ForwardEvent,
    HttpEvent, ListenerStore, ProxyConfig, ProxyListener, ProxyMaster,
};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const PIPE_SIZE: usize = 64 * 1024;

// ============================================================================
// Origins
// ============================================================================

/// Connector whose destinations are in-memory pipes. Each registered
/// address behaves like a listening socket.
#[derive(Default)]
pub struct MockConnector {
    origins: Mutex<HashMap<Address, mpsc::UnboundedSender<DuplexStream>>>,
    connects: Mutex<Vec<Address>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept side of `address`
    pub fn listen(&self, address: Address) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.origins.lock().unwrap().insert(address, tx);
        rx
    }

    /// Every address a connection was opened to, in order
    pub fn connects(&self) -> Vec<Address> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &Address) -> io::Result<BoxedStream> {
        self.connects.lock().unwrap().push(address.clone());
        let origins = self.origins.lock().unwrap();
        let origin = origins
            .get(address)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no origin"))?;
        let (proxy_side, origin_side) = tokio::io::duplex(PIPE_SIZE);
        origin
            .send(origin_side)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "origin gone"))?;
        Ok(Box::new(proxy_side))
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Records events and the order of lifecycle hooks
#[derive(Default)]
pub struct Recorder {
    pub http_events: Mutex<Vec<HttpEvent>>,
    pub forward_events: Mutex<Vec<ForwardEvent>>,
    pub lifecycle: Mutex<Vec<&'static str>>,
}

impl Recorder {
    /// HTTP events once at least `count` are recorded
    pub async fn http_events_after(&self, count: usize) -> Vec<HttpEvent> {
        within(async {
            loop {
                {
                    let events = self.http_events.lock().unwrap();
                    if events.len() >= count {
                        return events.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }
}

/// Registers a shared [`Recorder`]
pub struct RecordingListener(pub Arc<Recorder>);

#[async_trait]
impl ProxyListener for RecordingListener {
    fn on_init(&self, _ctx: &ConnectionContext) {
        self.0.lifecycle.lock().unwrap().push("init");
    }

    fn on_connect(&self, _ctx: &ConnectionContext) {
        self.0.lifecycle.lock().unwrap().push("connect");
    }

    fn on_http_event(&self, _ctx: &ConnectionContext, event: &HttpEvent) {
        self.0.http_events.lock().unwrap().push(event.clone());
    }

    fn on_forward_event(&self, _ctx: &ConnectionContext, event: &ForwardEvent) {
        self.0.forward_events.lock().unwrap().push(event.clone());
    }

    fn close(&self, _ctx: &ConnectionContext) {
        self.0.lifecycle.lock().unwrap().push("close");
    }
}

// ============================================================================
// Proxy
// ============================================================================

pub fn test_authority(name: &str) -> Arc<CertificateAuthority> {
    let (ca, _, _) = CertificateAuthority::generate(name, 32, Duration::from_secs(600)).unwrap();
    Arc::new(ca)
}

pub fn build_master(
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    store: ListenerStore,
    connector: Arc<MockConnector>,
) -> Arc<ProxyMaster> {
    Arc::new(
        ProxyMaster::builder(config)
            .authority(authority)
            .listeners(store)
            .connector(connector)
            .build()
            .unwrap(),
    )
}

/// Client end of a proxied connection and the task serving it
pub fn open_connection(master: &Arc<ProxyMaster>) -> (DuplexStream, JoinHandle<()>) {
    let (client, proxy_side) = tokio::io::duplex(PIPE_SIZE);
    let orchestrator = ConnectionOrchestrator::new(Arc::clone(master));
    let task = tokio::spawn(async move {
        orchestrator
            .handle(Box::new(proxy_side), Address::new("127.0.0.1", 50000))
            .await;
    });
    (client, task)
}

/// Fail instead of hanging when the proxy stalls
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}
