//! TLS interception end to end
//!
//! A client trusting the proxy root talks through `CONNECT` (or
//! transparently) to an origin presenting a certificate from a second
//! root. Covers ALPN mirroring, HTTP/2 interception, content coding and
//! the unsafe access policies.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{Method, Request, Response, StatusCode};
use nitmproxy::http1::MessageReader;
use nitmproxy::http2::Http2Headers;
use nitmproxy::{
    Address, CertificateAuthority, ConnectionContext, FullHttp2Response, Http2FramesWrapper,
    ListenerStore, ProxyConfig, ProxyListener, ProxyMode, Result, UnsafeAccess,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const HOST: &str = "example.com";
const LIMIT: usize = 1024 * 1024;

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    proxy_ca: Arc<CertificateAuthority>,
    origin_ca: Arc<CertificateAuthority>,
    connector: Arc<MockConnector>,
    origin: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Fixture {
    fn new() -> Self {
        let connector = MockConnector::new();
        let origin = connector.listen(Address::new(HOST, 443));
        Self {
            proxy_ca: test_authority("proxy root"),
            origin_ca: test_authority("origin root"),
            connector,
            origin,
        }
    }

    /// Upstream verifier that trusts the origin root
    fn trusting_origin(&self) -> Arc<dyn ServerCertVerifier> {
        let mut roots = RootCertStore::empty();
        roots.add(self.origin_ca.root_der()).unwrap();
        WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap()
    }

    fn master(&self, config: ProxyConfig, store: ListenerStore) -> Arc<nitmproxy::ProxyMaster> {
        build_master(
            config,
            Arc::clone(&self.proxy_ca),
            store,
            Arc::clone(&self.connector),
        )
    }

    async fn origin_acceptor(&self, alpn: &[&str]) -> TlsAcceptor {
        let issued = self.origin_ca.get_cert(HOST).await.unwrap();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(issued.chain(), issued.key())
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        TlsAcceptor::from(Arc::new(config))
    }

    fn client_connector(&self, alpn: &[&str]) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.proxy_ca.root_der()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        TlsConnector::from(Arc::new(config))
    }
}

async fn connect_tunnel(
    mut client: DuplexStream,
    connector: &TlsConnector,
) -> std::io::Result<TlsStream<DuplexStream>> {
    use tokio::io::AsyncReadExt;

    client
        .write_all(format!("CONNECT {}:443 HTTP/1.1\r\nHost: {}:443\r\n\r\n", HOST, HOST).as_bytes())
        .await?;
    let mut established = [0u8; 19];
    client.read_exact(&mut established).await?;
    assert_eq!(&established, b"HTTP/1.1 200 OK\r\n\r\n");
    connector
        .connect(ServerName::try_from(HOST).unwrap(), client)
        .await
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// What the HTTP/2 origin saw
#[derive(Debug)]
struct SeenByOrigin {
    alpn: Option<Vec<u8>>,
    path: String,
}

/// Serve one HTTP/2 request with `body` (gzip-encoded when asked) and keep
/// the connection alive until the client leaves.
fn spawn_h2_origin(
    acceptor: TlsAcceptor,
    mut listener: mpsc::UnboundedReceiver<DuplexStream>,
    body: &'static [u8],
    gzipped: bool,
) -> oneshot::Receiver<SeenByOrigin> {
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let stream = listener.recv().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        let mut connection = h2::server::handshake(tls).await.unwrap();

        let Some(Ok((request, mut respond))) = connection.accept().await else {
            return;
        };
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default();
        let _ = seen_tx.send(SeenByOrigin { alpn, path });

        let mut response = Response::builder().status(StatusCode::OK).header("content-type", "text/plain");
        let payload = if gzipped {
            response = response.header("content-encoding", "gzip");
            Bytes::from(gzip(body))
        } else {
            Bytes::from_static(body)
        };
        let mut send = respond.send_response(response.body(()).unwrap(), false).unwrap();
        send.send_data(payload, true).unwrap();

        while connection.accept().await.is_some() {}
    });
    seen_rx
}

/// Hold `count` HTTP/2 requests open, then answer them newest first with
/// their own path as body; `/missing` gets a 404.
fn spawn_h2_multi_origin(
    acceptor: TlsAcceptor,
    mut listener: mpsc::UnboundedReceiver<DuplexStream>,
    count: usize,
) {
    tokio::spawn(async move {
        let stream = listener.recv().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        let mut connection = h2::server::handshake(tls).await.unwrap();

        let mut pending = Vec::new();
        while pending.len() < count {
            let Some(Ok((request, respond))) = connection.accept().await else {
                return;
            };
            pending.push((request.uri().path().to_string(), respond));
        }
        for (path, mut respond) in pending.into_iter().rev() {
            let status = if path == "/missing" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            let response = Response::builder().status(status).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from(path), true).unwrap();
        }

        while connection.accept().await.is_some() {}
    });
}

/// Issue one HTTP/2 GET and collect the response
async fn h2_get(tls: TlsStream<DuplexStream>, uri: &str) -> (Response<()>, Vec<u8>) {
    let (sender, connection) = h2::client::handshake(tls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let mut sender = sender.ready().await.unwrap();
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(())
        .unwrap();
    let (response, _) = sender.send_request(request, true).unwrap();
    read_h2_response(within(response).await.unwrap()).await
}

async fn read_h2_response(response: Response<h2::RecvStream>) -> (Response<()>, Vec<u8>) {
    let (head, mut body) = response.into_parts();
    let mut data = Vec::new();
    while let Some(chunk) = within(body.data()).await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        data.extend_from_slice(&chunk);
    }
    (Response::from_parts(head, ()), data)
}

// ============================================================================
// Listeners
// ============================================================================

/// Replaces every HTTP/2 response body, remembering the decoded original
#[derive(Default)]
struct Rewriter {
    original: Mutex<Option<Bytes>>,
}

struct SharedRewriter(Arc<Rewriter>);

#[async_trait]
impl ProxyListener for SharedRewriter {
    fn intercept_http2_response(&self, _ctx: &ConnectionContext, _headers: &Http2Headers) -> bool {
        true
    }

    async fn on_http2_response(
        &self,
        _ctx: &ConnectionContext,
        response: &FullHttp2Response,
    ) -> Result<Option<FullHttp2Response>> {
        *self.0.original.lock().unwrap() = Some(response.body.clone());
        Ok(Some(FullHttp2Response::new(
            response.status,
            response.headers.clone(),
            Bytes::from_static(b"replaced"),
        )))
    }
}

/// Answers `/local` without contacting the origin
struct LocalAnswer;

#[async_trait]
impl ProxyListener for LocalAnswer {
    async fn on_http2_request(
        &self,
        _ctx: &ConnectionContext,
        request: &mut Http2FramesWrapper,
    ) -> Result<Option<Http2FramesWrapper>> {
        if request.request_path() != Some("/local") {
            return Ok(None);
        }
        let mut response = Response::new(Bytes::from_static(b"nope"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        Ok(Some(Http2FramesWrapper::from_response(
            request.stream_id(),
            response,
        )))
    }
}

// ============================================================================
// HTTP/2
// ============================================================================

/// The client's ALPN offer is mirrored upstream and the server's choice is
/// presented back to the client
#[tokio::test]
async fn test_h2_through_connect() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["h2", "http/1.1"]).await;
    let connector = fixture.client_connector(&["h2", "http/1.1"]);
    let seen = spawn_h2_origin(acceptor, fixture.origin, b"hello h2", false);

    let (client, _task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (response, body) = h2_get(tls, "https://example.com/api?x=1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, b"hello h2");

    let seen = within(seen).await.unwrap();
    assert_eq!(seen.alpn.as_deref(), Some(&b"h2"[..]));
    assert_eq!(seen.path, "/api?x=1");
}

/// Intercepted responses are decoded for listeners and re-encoded with the
/// original content coding
#[tokio::test]
async fn test_h2_response_rewrite_keeps_encoding() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let rewriter = Arc::new(Rewriter::default());
    let mut store = ListenerStore::new();
    store.add_last(SharedRewriter(Arc::clone(&rewriter)));
    let master = fixture.master(config, store);
    let acceptor = fixture.origin_acceptor(&["h2"]).await;
    let connector = fixture.client_connector(&["h2"]);
    let _seen = spawn_h2_origin(acceptor, fixture.origin, b"original body", true);

    let (client, _task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    let (response, body) = h2_get(tls, "https://example.com/").await;

    assert_eq!(response.headers()["content-encoding"], "gzip");
    assert_eq!(gunzip(&body), b"replaced");
    let length: usize = response.headers()["content-length"].to_str().unwrap().parse().unwrap();
    assert_eq!(length, body.len());
    assert_eq!(
        rewriter.original.lock().unwrap().as_deref(),
        Some(&b"original body"[..])
    );
}

/// A body that decodes past the content limit reaches the client as the
/// origin sent it and listeners never see it
#[tokio::test]
async fn test_h2_oversized_decoded_body_forwarded_as_is() {
    const EXPANDING: &[u8] = &[b'a'; 4096];

    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        max_content_length: 256,
        ..ProxyConfig::default()
    };
    let rewriter = Arc::new(Rewriter::default());
    let mut store = ListenerStore::new();
    store.add_last(SharedRewriter(Arc::clone(&rewriter)));
    let master = fixture.master(config, store);
    let acceptor = fixture.origin_acceptor(&["h2"]).await;
    let connector = fixture.client_connector(&["h2"]);
    let _seen = spawn_h2_origin(acceptor, fixture.origin, EXPANDING, true);

    let (client, _task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    let (response, body) = h2_get(tls, "https://example.com/").await;

    assert!(body.len() < 256);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    assert_eq!(gunzip(&body), EXPANDING);
    assert!(rewriter.original.lock().unwrap().is_none());
}

/// A listener answer is framed on the client's stream
#[tokio::test]
async fn test_h2_short_circuit() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let mut store = ListenerStore::new();
    store.add_last(LocalAnswer);
    store.add_last(RecordingListener(Arc::clone(&recorder)));
    let master = fixture.master(config, store);
    let acceptor = fixture.origin_acceptor(&["h2"]).await;
    let connector = fixture.client_connector(&["h2"]);
    let _seen = spawn_h2_origin(acceptor, fixture.origin, b"unused", false);

    let (client, task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    let (response, body) = h2_get(tls, "https://example.com/local").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body, b"nope");

    recorder.http_events_after(1).await;
    within(task).await.unwrap();
    let events = recorder.http_events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "/local");
    assert_eq!(events[0].status, Some(StatusCode::NOT_FOUND));
    assert_eq!(events[0].response_body_size, 4);
}

/// One event per stream, carrying the host, the path and the status the
/// origin answered with
#[tokio::test]
async fn test_h2_stream_emits_one_event() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let mut store = ListenerStore::new();
    store.add_last(RecordingListener(Arc::clone(&recorder)));
    let master = fixture.master(config, store);
    let acceptor = fixture.origin_acceptor(&["h2"]).await;
    let connector = fixture.client_connector(&["h2"]);
    let _seen = spawn_h2_origin(acceptor, fixture.origin, b"hello", false);

    let (client, task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    let (response, _) = h2_get(tls, "https://example.com/").await;
    assert_eq!(response.status(), StatusCode::OK);

    recorder.http_events_after(1).await;
    within(task).await.unwrap();
    let events = recorder.http_events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].host, HOST);
    assert_eq!(events[0].path, "/");
    assert_eq!(events[0].status, Some(StatusCode::OK));
    assert_eq!(events[0].content_type.as_deref(), Some("text/plain"));
    assert_eq!(events[0].response_body_size, 5);
}

/// Streams open at the same time are answered out of order by the origin
/// and each response lands on the stream that asked for it
#[tokio::test]
async fn test_h2_concurrent_streams() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let mut store = ListenerStore::new();
    store.add_last(RecordingListener(Arc::clone(&recorder)));
    let master = fixture.master(config, store);
    let acceptor = fixture.origin_acceptor(&["h2"]).await;
    let connector = fixture.client_connector(&["h2"]);
    let paths = ["/a", "/b", "/missing"];
    spawn_h2_multi_origin(acceptor, fixture.origin, paths.len());

    let (client, _task) = open_connection(&master);
    let tls = within(connect_tunnel(client, &connector)).await.unwrap();
    let (sender, connection) = h2::client::handshake(tls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let mut sender = sender.ready().await.unwrap();
    let mut pending = Vec::new();
    for path in paths {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("https://example.com{}", path))
            .body(())
            .unwrap();
        let (response, _) = sender.send_request(request, true).unwrap();
        pending.push((path, response));
        sender = within(sender.ready()).await.unwrap();
    }

    for (path, response) in pending {
        let (response, body) = read_h2_response(within(response).await.unwrap()).await;
        let expected = if path == "/missing" {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        };
        assert_eq!(response.status(), expected);
        assert_eq!(body, path.as_bytes());
    }

    let mut events = recorder.http_events_after(paths.len()).await;
    assert_eq!(events.len(), paths.len());
    events.sort_by(|a, b| a.path.cmp(&b.path));
    let seen: Vec<_> = events
        .iter()
        .map(|e| (e.host.as_str(), e.path.as_str(), e.status))
        .collect();
    assert_eq!(
        seen,
        vec![
            (HOST, "/a", Some(StatusCode::OK)),
            (HOST, "/b", Some(StatusCode::OK)),
            (HOST, "/missing", Some(StatusCode::NOT_FOUND)),
        ]
    );
}

// ============================================================================
// HTTP/1.1 over TLS
// ============================================================================

/// Serve HTTP/1.1 requests over TLS, answering each with its own path,
/// and report the negotiated ALPN and the paths seen.
fn spawn_h1_origin(
    acceptor: TlsAcceptor,
    mut listener: mpsc::UnboundedReceiver<DuplexStream>,
) -> (oneshot::Receiver<Option<Vec<u8>>>, mpsc::UnboundedReceiver<String>) {
    let (alpn_tx, alpn_rx) = oneshot::channel();
    let (path_tx, path_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let Some(stream) = listener.recv().await else {
            return;
        };
        let Ok(tls) = acceptor.accept(stream).await else {
            return;
        };
        let _ = alpn_tx.send(tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()));
        let (read, mut write) = tokio::io::split(tls);
        let mut requests = MessageReader::new(read, LIMIT);
        while let Ok(Some(request)) = requests.read_request().await {
            let path = request.uri().to_string();
            let _ = path_tx.send(path.clone());
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                path.len(),
                path
            );
            if write.write_all(response.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    (alpn_rx, path_rx)
}

async fn h1_get(tls: &mut TlsStream<DuplexStream>, path: &str) -> Response<Bytes> {
    tls.write_all(format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, HOST).as_bytes())
        .await
        .unwrap();
    let mut reader = MessageReader::new(&mut *tls, LIMIT);
    within(reader.read_response(&Method::GET))
        .await
        .unwrap()
        .expect("response")
}

/// A client offering only http/1.1 gets http/1.1 on both legs
#[tokio::test]
async fn test_http11_alpn_is_mirrored() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["h2", "http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (alpn, mut paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    let mut tls = within(connect_tunnel(client, &connector)).await.unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let response = h1_get(&mut tls, "/index.html").await;
    assert_eq!(&response.body()[..], b"/index.html");
    assert_eq!(within(alpn).await.unwrap().as_deref(), Some(&b"http/1.1"[..]));
    assert_eq!(within(paths.recv()).await.unwrap(), "/index.html");
}

/// Transparent mode takes the destination from SNI
#[tokio::test]
async fn test_transparent_tls_uses_sni() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        mode: ProxyMode::Transparent,
        trust_override: Some(fixture.trusting_origin()),
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (_alpn, _paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    let mut tls = within(connector.connect(ServerName::try_from(HOST).unwrap(), client))
        .await
        .unwrap();
    let response = h1_get(&mut tls, "/direct").await;
    assert_eq!(&response.body()[..], b"/direct");
    assert_eq!(fixture.connector.connects(), vec![Address::new(HOST, 443)]);
}

// ============================================================================
// Unsafe access
// ============================================================================

/// An untrusted origin is refused under the default policy
#[tokio::test]
async fn test_untrusted_origin_denied() {
    let fixture = Fixture::new();
    let master = fixture.master(ProxyConfig::default(), ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (_alpn, _paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    assert!(within(connect_tunnel(client, &connector)).await.is_err());
}

/// `insecure` skips validation altogether
#[tokio::test]
async fn test_insecure_accepts_untrusted_origin() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        insecure: true,
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (_alpn, _paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    let mut tls = within(connect_tunnel(client, &connector)).await.unwrap();
    assert_eq!(&h1_get(&mut tls, "/").await.body()[..], b"/");
}

/// Under `ask` the user gets a choice page first; accepting strips the
/// marker and lets the request through
#[tokio::test]
async fn test_ask_page_then_accept() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        unsafe_access: UnsafeAccess::Ask,
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (_alpn, mut paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    let mut tls = within(connect_tunnel(client, &connector)).await.unwrap();

    let page = h1_get(&mut tls, "/account").await;
    assert_eq!(page.status(), StatusCode::OK);
    assert_eq!(page.headers()["content-type"], "text/html");
    let html = String::from_utf8(page.body().to_vec()).unwrap();
    assert!(html.contains("/account;nitmproxy-unsafe=accept"));
    assert!(html.contains("/account;nitmproxy-unsafe=deny"));

    let accepted = h1_get(&mut tls, "/account;nitmproxy-unsafe=accept").await;
    assert_eq!(accepted.status(), StatusCode::OK);
    assert_eq!(&accepted.body()[..], b"/account");
    assert_eq!(within(paths.recv()).await.unwrap(), "/account");

    // Accepted destinations pass without the page
    let again = h1_get(&mut tls, "/other").await;
    assert_eq!(&again.body()[..], b"/other");
}

/// Choosing deny answers 403 from then on
#[tokio::test]
async fn test_ask_page_then_deny() {
    let fixture = Fixture::new();
    let config = ProxyConfig {
        unsafe_access: UnsafeAccess::Ask,
        ..ProxyConfig::default()
    };
    let master = fixture.master(config, ListenerStore::new());
    let acceptor = fixture.origin_acceptor(&["http/1.1"]).await;
    let connector = fixture.client_connector(&["http/1.1"]);
    let (_alpn, _paths) = spawn_h1_origin(acceptor, fixture.origin);

    let (client, _task) = open_connection(&master);
    let mut tls = within(connect_tunnel(client, &connector)).await.unwrap();

    let denied = h1_get(&mut tls, "/;nitmproxy-unsafe=deny").await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let still_denied = h1_get(&mut tls, "/").await;
    assert_eq!(still_denied.status(), StatusCode::FORBIDDEN);
}

