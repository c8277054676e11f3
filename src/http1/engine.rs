//! HTTP/1.1 proxy engine
//!
//! Two halves run side by side on one connection:
//! - requests: read from the client, routed, shown to the listeners, then
//!   written to the server (or answered directly);
//! - responses: read from the server in the order the requests were sent,
//!   rewritten by the listeners and written to the client.
//!
//! The request half queues one [`Pending`] entry per request *before*
//! writing it upstream, so the response half always knows which request a
//! response answers. A response with nothing queued is a protocol error.

use crate::address::{Address, HttpUrl};
use crate::config::ProxyMode;
use crate::context::{BoxedStream, ConnectionContext, Outbound, HTTP_1_1};
use crate::error::{ProxyError, Result};
use crate::event::{HttpEvent, HttpEventBuilder};
use crate::http1::codec::{MessageReader, MessageWriter};
use crate::http1::HttpObject;
use crate::ws::{self, WsUpgrade};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::header::{self, HeaderMap};
use http::{Method, Request, Response, StatusCode};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Reader = MessageReader<ReadHalf<BoxedStream>>;
type Writer = MessageWriter<WriteHalf<BoxedStream>>;

/// How requests find their server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routing {
    /// Destination fixed before the engine started
    Tunneled,
    /// Plain HTTP proxy: absolute-form requests pick the destination
    AbsoluteUri,
    /// Transparent plaintext: the `Host` header picks the destination
    HostHeader,
}

/// Response half's share of an upgraded connection
struct UpgradeHalf {
    client_write: WriteHalf<BoxedStream>,
    server_read: ReadHalf<BoxedStream>,
    server_leftover: BytesMut,
}

/// One request awaiting its response, in send order
enum Pending {
    Upstream {
        event: HttpEventBuilder,
        method: Method,
        /// Set when this request opened a new server connection
        reader: Option<Reader>,
        /// Set for WebSocket upgrade requests
        upgrade: Option<oneshot::Sender<UpgradeHalf>>,
    },
    /// Answered by a listener; nothing was sent upstream
    Synthetic {
        response: Response<Bytes>,
        event: HttpEventBuilder,
        reader: Option<Reader>,
    },
}

/// What woke the response half while no response was due
enum Idle {
    Next(Option<Pending>),
    /// Bytes (or EOF) from the server
    ServerData(std::io::Result<usize>),
}

/// Which half finished first
enum First {
    Requests(Result<Option<WsUpgrade>>),
    Responses(Result<bool>),
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}

fn request_host(request: &Request<Bytes>) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))
        .unwrap_or_default()
}

fn closed() -> ProxyError {
    ProxyError::protocol("response half closed")
}

pub struct Http1ProxyEngine {
    ctx: ConnectionContext,
}

impl Http1ProxyEngine {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    fn routing(&self, connected: bool) -> Routing {
        if connected {
            return Routing::Tunneled;
        }
        match self.ctx.config().mode {
            ProxyMode::Http => Routing::AbsoluteUri,
            ProxyMode::Transparent => Routing::HostHeader,
            ProxyMode::Socks => Routing::Tunneled,
        }
    }

    /// Proxy until either side closes. `server` is `None` when requests
    /// pick their own destination.
    pub async fn run(self, client: BoxedStream, server: Option<BoxedStream>) -> Result<()> {
        let routing = self.routing(server.is_some());
        let max = self.ctx.config().max_content_length;

        let (client_read, client_write) = tokio::io::split(client);
        let (server_reader, server_writer) = match server {
            Some(server) => {
                let (read, write) = tokio::io::split(server);
                (
                    Some(MessageReader::new(read, max)),
                    Some(MessageWriter::new(write)),
                )
            }
            None => (None, None),
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let mut requests =
            Box::pin(self.requests(MessageReader::new(client_read, max), server_writer, tx, routing));
        let mut responses =
            Box::pin(self.responses(MessageWriter::new(client_write), server_reader, rx, routing));

        let first = tokio::select! {
            r = &mut requests => First::Requests(r),
            r = &mut responses => First::Responses(r),
        };
        let outcome = match first {
            // Client gone: responses still owed are abandoned with the server
            First::Requests(other) => other,
            // Upgraded: the request half collects both halves
            First::Responses(Ok(true)) => (&mut requests).await,
            First::Responses(Ok(false)) => Ok(None),
            First::Responses(Err(e)) => Err(e),
        };
        // Releases the server halves, closing the server connection
        drop(requests);
        drop(responses);

        match outcome {
            Ok(Some(upgrade)) => ws::relay(&self.ctx, upgrade).await,
            Ok(None) => {
                self.ctx.server_closed();
                Ok(())
            }
            Err(e) => {
                self.ctx.server_closed();
                Err(e)
            }
        }
    }

    /// Pick the destination of `request`, connecting when it changes.
    /// Returns the reader of a newly opened connection.
    async fn route(
        &self,
        request: &mut Request<Bytes>,
        routing: Routing,
        server: &mut Option<Writer>,
    ) -> Result<Option<Reader>> {
        let address = match routing {
            Routing::Tunneled => return Ok(None),
            Routing::AbsoluteUri => {
                if request.method() == Method::CONNECT {
                    return Err(ProxyError::protocol("CONNECT on a forwarding connection"));
                }
                if request.uri().scheme().is_some() {
                    let url = HttpUrl::resolve(&request.uri().to_string())?;
                    *request.uri_mut() = url
                        .path()
                        .parse()
                        .map_err(|_| ProxyError::InvalidUrl(url.to_string()))?;
                    url.address()
                } else if self.ctx.is_server_active() {
                    return Ok(None);
                } else {
                    return Err(ProxyError::InvalidUrl(request.uri().to_string()));
                }
            }
            Routing::HostHeader => {
                if self.ctx.is_server_active() {
                    return Ok(None);
                }
                let host = request
                    .headers()
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .ok_or_else(|| ProxyError::protocol("request without Host header"))?;
                Address::resolve_with_default(host, 80)?
            }
        };

        match self.ctx.connect(address).await? {
            Outbound::Reused => Ok(None),
            Outbound::Opened(stream) => {
                self.ctx.tls_ctx().disable_tls(HTTP_1_1);
                let (read, write) = tokio::io::split(stream);
                *server = Some(MessageWriter::new(write));
                Ok(Some(MessageReader::new(
                    read,
                    self.ctx.config().max_content_length,
                )))
            }
        }
    }

    async fn requests(
        &self,
        mut client: Reader,
        mut server: Option<Writer>,
        tx: mpsc::UnboundedSender<Pending>,
        routing: Routing,
    ) -> Result<Option<WsUpgrade>> {
        let listener = self.ctx.listener();
        loop {
            let Some(mut request) = client.read_request().await? else {
                debug!("{} : client closed", self.ctx);
                return Ok(None);
            };
            let reader = self.route(&mut request, routing, &mut server).await?;

            let mut event = HttpEvent::builder(&self.ctx);
            event
                .method(request.method().clone())
                .version(request.version())
                .host(request_host(&request))
                .path(request.uri().to_string())
                .request_body_size(request.body().len() as u64)
                .request_time(Utc::now());

            if let Some(response) = listener.on_http1_request(&self.ctx, &mut request).await {
                debug!("{} : request answered by listener", self.ctx);
                tx.send(Pending::Synthetic {
                    response,
                    event,
                    reader,
                })
                .map_err(|_| closed())?;
                continue;
            }

            let upgrade = if is_websocket_upgrade(request.headers()) {
                let headers = request.headers_mut();
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::SEC_WEBSOCKET_EXTENSIONS);
                self.ctx.set_ws_path(request.uri().path());
                Some(oneshot::channel())
            } else {
                None
            };
            let (upgrade_tx, upgrade_rx) = match upgrade {
                Some((tx, rx)) => (Some(tx), Some(rx)),
                None => (None, None),
            };

            let writer = server
                .as_mut()
                .ok_or_else(|| ProxyError::protocol("no destination for request"))?;
            tx.send(Pending::Upstream {
                event,
                method: request.method().clone(),
                reader,
                upgrade: upgrade_tx,
            })
            .map_err(|_| closed())?;
            writer.write_request(&request).await?;

            // Not upgraded when the response half drops the sender
            if let Some(Ok(half)) = match upgrade_rx {
                Some(rx) => Some(rx.await),
                None => None,
            } {
                let server_write = server
                    .take()
                    .ok_or_else(|| ProxyError::protocol("upgrade without server"))?
                    .into_inner();
                let (client_read, client_leftover) = client.into_parts();
                debug!("{} : switching to websocket", self.ctx);
                return Ok(Some(WsUpgrade {
                    client: client_read.unsplit(half.client_write),
                    client_leftover: client_leftover.to_vec(),
                    server: half.server_read.unsplit(server_write),
                    server_leftover: half.server_leftover.to_vec(),
                }));
            }
        }
    }

    /// Returns `true` when the connection was upgraded and the halves were
    /// handed to the request side.
    async fn responses(
        &self,
        mut client: Writer,
        mut server: Option<Reader>,
        mut rx: mpsc::UnboundedReceiver<Pending>,
        routing: Routing,
    ) -> Result<bool> {
        let listener = self.ctx.listener();
        loop {
            let idle = match server.as_mut() {
                Some(reader) if !reader.buffered().is_empty() => match rx.try_recv() {
                    Ok(pending) => Idle::Next(Some(pending)),
                    Err(TryRecvError::Empty) => Idle::ServerData(Ok(1)),
                    Err(TryRecvError::Disconnected) => Idle::Next(None),
                },
                Some(reader) => tokio::select! {
                    biased;
                    pending = rx.recv() => Idle::Next(pending),
                    read = reader.fill() => Idle::ServerData(read),
                },
                None => Idle::Next(rx.recv().await),
            };
            let pending = match idle {
                Idle::Next(pending) => pending,
                Idle::ServerData(read) => {
                    if read? > 0 {
                        return Err(ProxyError::protocol("response without request"));
                    }
                    debug!("{} : server closed", self.ctx);
                    self.ctx.server_closed();
                    if routing == Routing::Tunneled {
                        return Ok(false);
                    }
                    server = None;
                    continue;
                }
            };
            let Some(pending) = pending else {
                return Ok(false);
            };

            match pending {
                Pending::Synthetic {
                    response,
                    mut event,
                    reader,
                } => {
                    if let Some(reader) = reader {
                        server = Some(reader);
                    }
                    event
                        .response_head(response.status(), response.headers())
                        .response_body_size(response.body().len() as u64)
                        .response_time(Utc::now());
                    client.write_response(&response).await?;
                    listener.on_http_event(&self.ctx, &event.build());
                }
                Pending::Upstream {
                    mut event,
                    method,
                    reader,
                    upgrade,
                } => {
                    if let Some(reader) = reader {
                        server = Some(reader);
                    }
                    let reader = server
                        .as_mut()
                        .ok_or_else(|| ProxyError::protocol("no server connection for request"))?;
                    let Some(response) = reader.read_response(&method).await? else {
                        return Err(ProxyError::protocol("server closed before responding"));
                    };

                    if let (StatusCode::SWITCHING_PROTOCOLS, Some(upgrade)) =
                        (response.status(), upgrade)
                    {
                        event
                            .response_head(response.status(), response.headers())
                            .response_time(Utc::now());
                        client.write_response(&response).await?;
                        listener.on_http_event(&self.ctx, &event.build());

                        let (server_read, server_leftover) = server
                            .take()
                            .ok_or_else(|| ProxyError::protocol("upgrade without server"))?
                            .into_parts();
                        let half = UpgradeHalf {
                            client_write: client.into_inner(),
                            server_read,
                            server_leftover,
                        };
                        return match upgrade.send(half) {
                            Ok(()) => Ok(true),
                            Err(_) => Err(closed()),
                        };
                    }

                    let mut emitted = false;
                    for object in listener.on_http1_response(&self.ctx, HttpObject::Full(response)) {
                        record(&mut event, &object);
                        let last = object.is_last();
                        client.write_object(object).await?;
                        if last && !emitted {
                            emitted = true;
                            listener.on_http_event(&self.ctx, &event.build());
                        }
                    }
                }
            }
        }
    }
}

/// Account for one object written to the client
fn record(event: &mut HttpEventBuilder, object: &HttpObject) {
    match object {
        HttpObject::Full(response) => {
            event
                .response_head(response.status(), response.headers())
                .add_response_body_size(response.body().len() as u64)
                .response_time(Utc::now());
        }
        HttpObject::Head(head) => {
            event
                .response_head(head.status(), head.headers())
                .response_time(Utc::now());
        }
        HttpObject::Content(data) => {
            event.add_response_body_size(data.len() as u64);
        }
        HttpObject::LastContent(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenerStore, ProxyListener};
    use crate::master::tests::test_master_with;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<HttpEvent>>>,
    }

    #[async_trait]
    impl ProxyListener for Recorder {
        fn on_http_event(&self, _ctx: &ConnectionContext, event: &HttpEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct Blocker;

    #[async_trait]
    impl ProxyListener for Blocker {
        async fn on_http1_request(
            &self,
            _ctx: &ConnectionContext,
            request: &mut Request<Bytes>,
        ) -> Result<Option<Response<Bytes>>> {
            if request.uri().path() != "/blocked" {
                return Ok(None);
            }
            let mut response = Response::new(Bytes::from_static(b"no"));
            *response.status_mut() = StatusCode::FORBIDDEN;
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, http::HeaderValue::from(2));
            Ok(Some(response))
        }
    }

    fn start(store: ListenerStore) -> (DuplexStream, DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let ctx = ConnectionContext::new(Address::new("127.0.0.1", 50000), test_master_with(store));
        ctx.set_server_addr(Address::new("origin.test", 80));
        let (client, client_peer) = tokio::io::duplex(8192);
        let (server, server_peer) = tokio::io::duplex(8192);
        let engine = tokio::spawn(
            Http1ProxyEngine::new(ctx).run(Box::new(client), Some(Box::new(server))),
        );
        (client_peer, server_peer, engine)
    }

    async fn read_until(stream: &mut DuplexStream, marker: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while !out.windows(marker.len()).any(|w| w == marker) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_pipelined_requests_pair_in_order() {
        let recorder = Recorder::default();
        let mut store = ListenerStore::new();
        store.add_last(recorder.clone());
        let (mut client, mut server, engine) = start(store);

        client
            .write_all(b"GET /one HTTP/1.1\r\nHost: origin.test\r\n\r\nGET /two HTTP/1.1\r\nHost: origin.test\r\n\r\n")
            .await
            .unwrap();
        read_until(&mut server, b"/two").await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\nbb")
            .await
            .unwrap();
        read_until(&mut client, b"bb").await;

        drop(client);
        engine.await.unwrap().unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, "/one");
        assert_eq!(events[0].status, Some(StatusCode::OK));
        assert_eq!(events[1].path, "/two");
        assert_eq!(events[1].status, Some(StatusCode::NOT_FOUND));
        assert_eq!(events[1].response_body_size, 2);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_server() {
        let recorder = Recorder::default();
        let mut store = ListenerStore::new();
        store.add_last(Blocker).add_last(recorder.clone());
        let (mut client, mut server, engine) = start(store);

        client
            .write_all(b"GET /blocked HTTP/1.1\r\nHost: origin.test\r\n\r\n")
            .await
            .unwrap();
        let answer = read_until(&mut client, b"no").await;
        assert!(answer.starts_with(b"HTTP/1.1 403"));

        drop(client);
        engine.await.unwrap().unwrap();

        let mut upstream = Vec::new();
        server.read_to_end(&mut upstream).await.unwrap();
        assert!(upstream.is_empty());
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_fatal() {
        let (_client, mut server, engine) = start(ListenerStore::new());
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(engine.await.unwrap(), Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_client_close_releases_waiting_server() {
        let (mut client, mut server, engine) = start(ListenerStore::new());

        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: origin.test\r\n\r\n")
            .await
            .unwrap();
        read_until(&mut server, b"/slow").await;
        drop(client);

        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), engine).await;
        assert!(finished.unwrap().unwrap().is_ok());

        let mut rest = Vec::new();
        let eof = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            server.read_to_end(&mut rest),
        )
        .await;
        assert!(eof.unwrap().is_ok());
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        headers.remove(header::CONNECTION);
        assert!(!is_websocket_upgrade(&headers));
    }
}
