//! HTTP/2 proxy engine
//!
//! Every client stream is handled by its own task:
//! 1. request frames are collected until end of stream;
//! 2. listeners may answer the request themselves, otherwise it is sent
//!    upstream on a new server stream;
//! 3. the response is streamed back frame by frame, or buffered, decoded,
//!    handed to listeners, re-encoded and re-framed when a listener asked
//!    to intercept it;
//! 4. one `HttpEvent` is emitted when the stream completes.

use crate::context::{BoxedStream, ConnectionContext};
use crate::error::{ProxyError, Result};
use crate::http2::collector::FrameCollector;
use crate::http2::encoding::decode_body;
use crate::http2::frames::{
    strip_connection_headers, FullHttp2Response, Http2Data, Http2Frame, Http2FramesWrapper,
    Http2Head, Http2Headers,
};
use crate::http2::stream_map::StreamIdMap;
use crate::http2::H2Error;
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use h2::{RecvStream, SendStream};
use http::header::{self, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, Uri};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Engine for one client connection negotiated as `h2`
pub struct Http2ProxyEngine {
    ctx: ConnectionContext,
}

struct Shared {
    ctx: ConnectionContext,
    streams: StreamIdMap,
    /// Serializes stream opening so server ids are recorded in the order
    /// `h2` allocates them
    open_lock: Mutex<()>,
    max_frame_size: usize,
}

impl Http2ProxyEngine {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    /// Proxy until either connection closes. Closing one side drops the
    /// other.
    pub async fn run(self, client: BoxedStream, server: BoxedStream) -> Result<()> {
        let config = self.ctx.config().http2.clone();

        let mut client_h2 = h2::server::Builder::new()
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_concurrent_streams(config.max_concurrent_streams)
            .max_frame_size(config.max_frame_size)
            .handshake::<_, Bytes>(client)
            .await
            .map_err(|e| H2Error::Client("handshake", e))?;

        debug!("{} : http2 client handshake complete", self.ctx);

        let (upstream, connection) = h2::client::Builder::new()
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_frame_size(config.max_frame_size)
            .enable_push(false)
            .handshake::<_, Bytes>(server)
            .await
            .map_err(|e| H2Error::Server("handshake", e))?;

        debug!("{} : http2 server handshake complete", self.ctx);

        let shared = Arc::new(Shared {
            ctx: self.ctx.clone(),
            streams: StreamIdMap::new(),
            open_lock: Mutex::new(()),
            max_frame_size: config.max_frame_size as usize,
        });
        let mut tasks = JoinSet::new();
        tokio::pin!(connection);

        let result: Result<()> = loop {
            tokio::select! {
                accepted = client_h2.accept() => match accepted {
                    Some(Ok((request, respond))) => {
                        let shared = Arc::clone(&shared);
                        let upstream = upstream.clone();
                        tasks.spawn(async move {
                            let client_id = respond.stream_id().as_u32();
                            let result = proxy_stream(&shared, upstream, request, respond).await;
                            shared.streams.remove(client_id);
                            (client_id, result)
                        });
                    }
                    Some(Err(e)) => {
                        if e.reason() == Some(h2::Reason::NO_ERROR) {
                            debug!("{} : http2 client went away", self.ctx);
                            break Ok(());
                        }
                        if e.is_io() || e.is_go_away() {
                            break Err(H2Error::Client("accept stream", e).into());
                        }
                        warn!("{} : http2 stream error, continuing: {}", self.ctx, e);
                    }
                    None => break Ok(()),
                },
                closed = &mut connection => {
                    debug!("{} : http2 server connection closed", self.ctx);
                    break closed.map_err(|e| H2Error::Server("connection", e).into());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((stream_id, Err(e))) => {
                            warn!("{} : http2 stream {} failed: {}", self.ctx, stream_id, e);
                        }
                        Ok((_, Ok(()))) => {}
                        Err(e) if e.is_panic() => warn!("{} : http2 stream task panicked", self.ctx),
                        Err(_) => {}
                    }
                }
            }
        };

        tasks.abort_all();
        self.ctx.server_closed();
        debug!("{} : http2 connection closed", self.ctx);
        result
    }
}

/// Request sent upstream: scheme and authority are mandatory in HTTP/2.
fn upstream_request(head: &Http2Headers) -> Result<Request<()>> {
    let Http2Head::Request {
        method,
        uri,
        headers,
    } = &head.head
    else {
        return Err(ProxyError::protocol("request stream without request headers"));
    };

    let mut parts = uri.clone().into_parts();
    if parts.scheme.is_none() {
        parts.scheme = Some(Scheme::HTTPS);
    }
    if parts.authority.is_none() {
        parts.authority = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok());
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    let uri = Uri::from_parts(parts).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

    let mut headers = headers.clone();
    strip_connection_headers(&mut headers);
    headers.remove(header::HOST);

    let mut request = Request::new(());
    *request.method_mut() = method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = http::Version::HTTP_2;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Send `data` respecting the peer's flow-control window.
async fn send_data(stream: &mut SendStream<Bytes>, mut data: Bytes, end_stream: bool) -> Result<()> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| ProxyError::Http2("stream closed while sending".to_string()))?
            .map_err(H2Error::Body)?;
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        let last = data.is_empty() && end_stream;
        stream.send_data(chunk, last).map_err(H2Error::Body)?;
        if last {
            return Ok(());
        }
    }
    if end_stream {
        stream.send_data(Bytes::new(), true).map_err(H2Error::Body)?;
    }
    Ok(())
}

/// Next frame of a received message, `None` after end of stream
async fn next_frame(
    stream_id: u32,
    body: &mut RecvStream,
    ended: &mut bool,
) -> Result<Option<Http2Frame>> {
    if *ended {
        return Ok(None);
    }
    match body.data().await {
        Some(chunk) => {
            let chunk = chunk.map_err(H2Error::Body)?;
            let _ = body.flow_control().release_capacity(chunk.len());
            *ended = body.is_end_stream();
            Ok(Some(Http2Frame::Data(Http2Data::new(stream_id, chunk, *ended))))
        }
        None => {
            *ended = true;
            let frame = match body.trailers().await.map_err(H2Error::Body)? {
                Some(trailers) => Http2Frame::Headers(Http2Headers::new(
                    stream_id,
                    Http2Head::Trailers(trailers),
                    true,
                )),
                None => Http2Frame::Data(Http2Data::new(stream_id, Bytes::new(), true)),
            };
            Ok(Some(frame))
        }
    }
}

/// Response frames towards the client, on the client's stream
struct ClientWriter {
    respond: h2::server::SendResponse<Bytes>,
    stream: Option<SendStream<Bytes>>,
    ended: bool,
}

impl ClientWriter {
    fn new(respond: h2::server::SendResponse<Bytes>) -> Self {
        Self {
            respond,
            stream: None,
            ended: false,
        }
    }

    async fn write(&mut self, frame: Http2Frame) -> Result<()> {
        if self.ended {
            return Err(ProxyError::protocol("response frame after end of stream"));
        }
        let end_stream = frame.is_end_stream();

        match (frame, self.stream.as_mut()) {
            (
                Http2Frame::Headers(Http2Headers {
                    head: Http2Head::Response { status, mut headers },
                    ..
                }),
                None,
            ) => {
                strip_connection_headers(&mut headers);
                let mut response = Response::new(());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                let stream = self
                    .respond
                    .send_response(response, end_stream)
                    .map_err(|e| H2Error::Client("send response", e))?;
                self.stream = Some(stream);
            }
            (
                Http2Frame::Headers(Http2Headers {
                    head: Http2Head::Trailers(trailers),
                    ..
                }),
                Some(stream),
            ) => {
                stream.send_trailers(trailers).map_err(H2Error::Body)?;
            }
            (Http2Frame::Data(data), Some(stream)) => {
                send_data(stream, data.data, end_stream).await?;
            }
            (frame, _) => {
                return Err(ProxyError::protocol(format!(
                    "unexpected response frame on stream {}",
                    frame.stream_id()
                )));
            }
        }

        self.ended = end_stream;
        Ok(())
    }
}

async fn deliver(
    writer: &mut ClientWriter,
    collector: &mut FrameCollector,
    frames: Vec<Http2Frame>,
) -> Result<()> {
    for frame in frames {
        collector.on_response_frame(&frame);
        writer.write(frame).await?;
    }
    Ok(())
}

/// Give every frame the client-facing stream id.
fn on_client_stream(mut frame: Http2Frame, stream_id: u32) -> Http2Frame {
    match &mut frame {
        Http2Frame::Headers(headers) => headers.stream_id = stream_id,
        Http2Frame::Data(data) => data.stream_id = stream_id,
    }
    frame
}

async fn proxy_stream(
    shared: &Shared,
    upstream: h2::client::SendRequest<Bytes>,
    request: Request<RecvStream>,
    respond: h2::server::SendResponse<Bytes>,
) -> Result<()> {
    let ctx = &shared.ctx;
    let client_id = respond.stream_id().as_u32();
    let mut collector = FrameCollector::new(ctx, client_id);

    // 1. collect the request
    let (parts, mut body) = request.into_parts();
    let mut ended = body.is_end_stream();
    let head = Http2Headers::new(
        client_id,
        Http2Head::Request {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        },
        ended,
    );
    let mut complete = collector.on_request_frame(Http2Frame::Headers(head))?;
    while complete.is_none() {
        match next_frame(client_id, &mut body, &mut ended).await? {
            Some(frame) => complete = collector.on_request_frame(frame)?,
            None => return Err(ProxyError::protocol("request stream ended without end of stream")),
        }
    }
    let Some(mut request) = complete else {
        return Ok(());
    };

    // 2. short-circuit or forward
    let mut writer = ClientWriter::new(respond);
    if let Some(answer) = ctx.listener().on_http2_request(ctx, &mut request).await {
        debug!("{} : http2 stream {} answered by listener", ctx, client_id);
        let frames = answer
            .into_frames()
            .into_iter()
            .map(|frame| on_client_stream(frame, client_id))
            .collect();
        deliver(&mut writer, &mut collector, frames).await?;
        ctx.listener().on_http_event(ctx, &collector.build_event());
        return Ok(());
    }

    let (response_future, server_id) = send_upstream(shared, upstream, client_id, request).await?;

    // 3. response
    let response = response_future
        .await
        .map_err(|e| H2Error::Server("response", e))?;
    let mapped = shared.streams.require_client_id(server_id)?;
    if mapped != client_id {
        return Err(ProxyError::protocol(format!(
            "server stream {} belongs to client stream {}, not {}",
            server_id, mapped, client_id
        )));
    }

    let (parts, mut body) = response.into_parts();
    let mut ended = body.is_end_stream();
    let headers = Http2Headers::new(
        client_id,
        Http2Head::Response {
            status: parts.status,
            headers: parts.headers,
        },
        ended,
    );

    if ctx.listener().intercept_http2_response(ctx, &headers) {
        let mut buffered = vec![Http2Frame::Headers(headers)];
        while let Some(frame) = next_frame(client_id, &mut body, &mut ended).await? {
            buffered.push(frame);
        }
        let frames = intercept_response(shared, client_id, buffered).await?;
        deliver(&mut writer, &mut collector, frames).await?;
    } else {
        let mut next = Some(Http2Frame::Headers(headers));
        while let Some(frame) = next {
            let frames = ctx.listener().on_http2_response_frame(ctx, frame);
            deliver(&mut writer, &mut collector, frames).await?;
            next = next_frame(client_id, &mut body, &mut ended).await?;
        }
    }

    // 4. done
    if !collector.is_response_done() {
        return Err(ProxyError::protocol(format!(
            "response on stream {} did not end",
            client_id
        )));
    }
    ctx.listener().on_http_event(ctx, &collector.build_event());
    Ok(())
}

async fn send_upstream(
    shared: &Shared,
    upstream: h2::client::SendRequest<Bytes>,
    client_id: u32,
    request: Http2FramesWrapper,
) -> Result<(h2::client::ResponseFuture, u32)> {
    let head = upstream_request(request.headers())?;
    let end_stream = request.headers().end_stream;
    let mut upstream = upstream
        .ready()
        .await
        .map_err(|e| H2Error::Server("send request", e))?;

    let (response_future, mut send_stream, server_id) = {
        let _open = shared.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (response_future, send_stream) = upstream
            .send_request(head, end_stream)
            .map_err(|e| H2Error::Server("send request", e))?;
        let server_id = response_future.stream_id().as_u32();
        shared.streams.insert(client_id, server_id)?;
        (response_future, send_stream, server_id)
    };
    debug!(
        "{} : http2 stream {} -> server stream {}",
        shared.ctx, client_id, server_id
    );

    for frame in request.into_frames().into_iter().skip(1) {
        match frame {
            Http2Frame::Data(data) => send_data(&mut send_stream, data.data, data.end_stream).await?,
            Http2Frame::Headers(Http2Headers {
                head: Http2Head::Trailers(trailers),
                ..
            }) => send_stream.send_trailers(trailers).map_err(H2Error::Body)?,
            Http2Frame::Headers(_) => {
                return Err(ProxyError::protocol("headers in the middle of a request"));
            }
        }
    }

    Ok((response_future, server_id))
}

/// Aggregate, decode, offer to listeners and re-frame a buffered response.
/// Without a replacement the original frames are returned untouched.
async fn intercept_response(
    shared: &Shared,
    client_id: u32,
    frames: Vec<Http2Frame>,
) -> Result<Vec<Http2Frame>> {
    let ctx = &shared.ctx;
    let Some(Http2Frame::Headers(Http2Headers {
        head: Http2Head::Response { status, headers },
        ..
    })) = frames.first()
    else {
        return Err(ProxyError::protocol("intercepted response without headers"));
    };

    let mut body = BytesMut::new();
    for frame in &frames {
        if let Http2Frame::Data(data) = frame {
            body.extend_from_slice(&data.data);
        }
    }
    let body = body.freeze();

    let (encoding, decoded) = match decode_body(headers, &body, ctx.config().max_content_length) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("{} : forwarding response as is: {}", ctx, e);
            return Ok(frames);
        }
    };
    let original = FullHttp2Response::new(*status, headers.clone(), decoded);

    let Some(mut replacement) = ctx.listener().on_http2_response(ctx, &original).await else {
        return Ok(frames);
    };

    if let Some(encoding) = encoding {
        replacement.body = encoding.encode(&replacement.body)?;
        replacement
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding.name()));
    }
    replacement.set_content_length();
    debug!(
        "{} : http2 stream {} response replaced ({} bytes)",
        ctx,
        client_id,
        replacement.body.len()
    );
    Ok(replacement.into_frames(client_id, shared.max_frame_size))
}
