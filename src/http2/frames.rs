//! HTTP/2 frame model
//!
//! The `h2` crate hides raw frames behind request/response streams. The
//! engine rebuilds a frame-level view from those streams so listeners can
//! inspect and rewrite individual HEADERS/DATA frames per stream.

use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, Request, Response, StatusCode, Uri};

/// Headers that are illegal on an HTTP/2 connection
const CONNECTION_HEADERS: [&str; 5] = [
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-connection",
];

/// Decoded content of a HEADERS frame
#[derive(Debug, Clone, PartialEq)]
pub enum Http2Head {
    Request {
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    },
    Response {
        status: StatusCode,
        headers: HeaderMap,
    },
    Trailers(HeaderMap),
}

impl Http2Head {
    pub fn headers(&self) -> &HeaderMap {
        match self {
            Self::Request { headers, .. } | Self::Response { headers, .. } => headers,
            Self::Trailers(headers) => headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            Self::Request { headers, .. } | Self::Response { headers, .. } => headers,
            Self::Trailers(headers) => headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Http2Headers {
    pub stream_id: u32,
    pub head: Http2Head,
    pub end_stream: bool,
}

impl Http2Headers {
    pub fn new(stream_id: u32, head: Http2Head, end_stream: bool) -> Self {
        Self {
            stream_id,
            head,
            end_stream,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.head {
            Http2Head::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Http2Data {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
}

impl Http2Data {
    pub fn new(stream_id: u32, data: impl Into<Bytes>, end_stream: bool) -> Self {
        Self {
            stream_id,
            data: data.into(),
            end_stream,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Http2Frame {
    Headers(Http2Headers),
    Data(Http2Data),
}

impl Http2Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Headers(headers) => headers.stream_id,
            Self::Data(data) => data.stream_id,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            Self::Headers(headers) => headers.end_stream,
            Self::Data(data) => data.end_stream,
        }
    }

    pub(crate) fn set_end_stream(&mut self, end_stream: bool) {
        match self {
            Self::Headers(headers) => headers.end_stream = end_stream,
            Self::Data(data) => data.end_stream = end_stream,
        }
    }

    /// Payload length counted towards body sizes
    pub fn data_len(&self) -> usize {
        match self {
            Self::Data(data) => data.data.len(),
            Self::Headers(_) => 0,
        }
    }
}

impl From<Http2Headers> for Http2Frame {
    fn from(headers: Http2Headers) -> Self {
        Self::Headers(headers)
    }
}

impl From<Http2Data> for Http2Frame {
    fn from(data: Http2Data) -> Self {
        Self::Data(data)
    }
}

/// The complete frame sequence of one message on one stream.
///
/// Always starts with a request or response HEADERS frame and ends with
/// the end-of-stream flag; use [`Http2FramesWrapper::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Http2FramesWrapper {
    stream_id: u32,
    headers: Http2Headers,
    tail: Vec<Http2Frame>,
}

impl Http2FramesWrapper {
    pub fn builder(stream_id: u32) -> Http2FramesWrapperBuilder {
        Http2FramesWrapperBuilder {
            stream_id,
            frames: Vec::new(),
        }
    }

    /// Frames for a full response: `:status` plus headers, and a DATA
    /// frame only when the body is non-empty.
    pub fn from_response(stream_id: u32, response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        let mut headers = parts.headers;
        strip_connection_headers(&mut headers);

        let head = Http2Headers::new(
            stream_id,
            Http2Head::Response {
                status: parts.status,
                headers,
            },
            body.is_empty(),
        );
        let mut tail = Vec::new();
        if !body.is_empty() {
            tail.push(Http2Frame::Data(Http2Data::new(stream_id, body, true)));
        }
        Self {
            stream_id,
            headers: head,
            tail,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// The leading HEADERS frame
    pub fn headers(&self) -> &Http2Headers {
        &self.headers
    }

    /// Frames after the leading HEADERS frame
    pub fn tail(&self) -> &[Http2Frame] {
        &self.tail
    }

    /// Number of frames, headers included
    pub fn frame_count(&self) -> usize {
        1 + self.tail.len()
    }

    pub fn into_frames(self) -> Vec<Http2Frame> {
        let mut frames = Vec::with_capacity(1 + self.tail.len());
        frames.push(Http2Frame::Headers(self.headers));
        frames.extend(self.tail);
        frames
    }

    pub fn is_request(&self) -> bool {
        matches!(self.headers().head, Http2Head::Request { .. })
    }

    pub fn data(&self) -> impl Iterator<Item = &Http2Data> {
        self.tail.iter().filter_map(|frame| match frame {
            Http2Frame::Data(data) => Some(data),
            Http2Frame::Headers(_) => None,
        })
    }

    /// Concatenated DATA payloads
    pub fn body(&self) -> Bytes {
        let mut body = BytesMut::new();
        for data in self.data() {
            body.extend_from_slice(&data.data);
        }
        body.freeze()
    }

    pub fn body_len(&self) -> usize {
        self.data().map(|data| data.data.len()).sum()
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.tail.iter().find_map(|frame| match frame {
            Http2Frame::Headers(Http2Headers {
                head: Http2Head::Trailers(trailers),
                ..
            }) => Some(trailers),
            _ => None,
        })
    }

    /// Path and query of a request, `None` for responses
    pub fn request_path(&self) -> Option<&str> {
        match &self.headers().head {
            Http2Head::Request { uri, .. } => {
                Some(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))
            }
            _ => None,
        }
    }

    /// Replace the path and query of a request, keeping scheme and
    /// authority.
    pub fn set_request_path(&mut self, path: &str) -> Result<()> {
        let Http2Head::Request { uri, .. } = &mut self.headers.head else {
            return Err(ProxyError::protocol("not an HTTP/2 request"));
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(
            PathAndQuery::try_from(path).map_err(|_| ProxyError::InvalidUrl(path.to_string()))?,
        );
        *uri = Uri::from_parts(parts).map_err(|_| ProxyError::InvalidUrl(path.to_string()))?;
        Ok(())
    }

    /// Aggregate into a single request with an `https` scheme and the
    /// authority taken from `:authority` or `Host`.
    pub fn to_full_request(&self) -> Result<Request<Bytes>> {
        let Http2Head::Request {
            method,
            uri,
            headers,
        } = &self.headers().head
        else {
            return Err(ProxyError::protocol("not an HTTP/2 request"));
        };

        let authority = match uri.authority() {
            Some(authority) => Some(authority.clone()),
            None => headers
                .get(header::HOST)
                .and_then(|host| host.to_str().ok())
                .and_then(|host| host.parse::<Authority>().ok()),
        };

        let mut parts = uri.clone().into_parts();
        parts.scheme = Some(Scheme::HTTPS);
        parts.authority = authority;
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let uri = Uri::from_parts(parts).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

        let mut request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .version(http::Version::HTTP_2)
            .body(self.body())
            .map_err(|e| ProxyError::protocol(e.to_string()))?;
        *request.headers_mut() = headers.clone();
        Ok(request)
    }
}

/// Validating builder for [`Http2FramesWrapper`]
#[derive(Debug)]
pub struct Http2FramesWrapperBuilder {
    stream_id: u32,
    frames: Vec<Http2Frame>,
}

impl Http2FramesWrapperBuilder {
    pub fn headers(mut self, head: Http2Head, end_stream: bool) -> Self {
        self.frames.push(Http2Frame::Headers(Http2Headers::new(
            self.stream_id,
            head,
            end_stream,
        )));
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>, end_stream: bool) -> Self {
        self.frames
            .push(Http2Frame::Data(Http2Data::new(self.stream_id, data, end_stream)));
        self
    }

    pub fn frame(mut self, frame: Http2Frame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn build(self) -> Result<Http2FramesWrapper> {
        let mut frames = self.frames.into_iter();
        let headers = match frames.next() {
            Some(Http2Frame::Headers(
                headers @ Http2Headers {
                    head: Http2Head::Request { .. } | Http2Head::Response { .. },
                    ..
                },
            )) => headers,
            _ => return Err(ProxyError::protocol("HTTP/2 message must start with headers")),
        };
        let tail: Vec<Http2Frame> = frames.collect();

        let mut ended = false;
        for frame in std::iter::once(&Http2Frame::Headers(headers.clone())).chain(&tail) {
            if ended {
                return Err(ProxyError::protocol("HTTP/2 frame after end of stream"));
            }
            if frame.stream_id() != self.stream_id {
                return Err(ProxyError::protocol(format!(
                    "HTTP/2 frame for stream {} in message of stream {}",
                    frame.stream_id(),
                    self.stream_id
                )));
            }
            ended = frame.is_end_stream();
        }
        if !ended {
            return Err(ProxyError::protocol("HTTP/2 message not ended"));
        }

        Ok(Http2FramesWrapper {
            stream_id: self.stream_id,
            headers,
            tail,
        })
    }
}

/// A response aggregated from its frames, handed to response interceptors
#[derive(Debug, Clone, PartialEq)]
pub struct FullHttp2Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FullHttp2Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Overwrite `content-length` with the current body length.
    pub fn set_content_length(&mut self) {
        self.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }

    /// Re-frame as HEADERS, DATA chunks of at most `max_frame_size` bytes
    /// and a final empty DATA frame carrying end-of-stream.
    pub fn into_frames(self, stream_id: u32, max_frame_size: usize) -> Vec<Http2Frame> {
        let max_frame_size = max_frame_size.max(1);
        let mut frames = Vec::with_capacity(2 + self.body.len() / max_frame_size);
        let mut headers = self.headers;
        strip_connection_headers(&mut headers);
        frames.push(Http2Frame::Headers(Http2Headers::new(
            stream_id,
            Http2Head::Response {
                status: self.status,
                headers,
            },
            false,
        )));

        let mut body = self.body;
        while !body.is_empty() {
            let chunk = body.split_to(body.len().min(max_frame_size));
            frames.push(Http2Frame::Data(Http2Data::new(stream_id, chunk, false)));
        }
        frames.push(Http2Frame::Data(Http2Data::new(stream_id, Bytes::new(), true)));
        frames
    }
}

impl From<Response<Bytes>> for FullHttp2Response {
    fn from(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self::new(parts.status, parts.headers, body)
    }
}

/// Drop headers that an HTTP/2 peer must reject.
pub fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in CONNECTION_HEADERS {
        headers.remove(name);
    }
    if headers
        .get(header::TE)
        .map(|te| te.as_bytes() != b"trailers")
        .unwrap_or(false)
    {
        headers.remove(header::TE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Http2Head {
        Http2Head::Request {
            method: Method::GET,
            uri: format!("https://example.com{}", path).parse().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_builder_requires_headers() {
        let err = Http2FramesWrapper::builder(1)
            .data(Bytes::from_static(b"body"), true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must start with headers"));
    }

    #[test]
    fn test_builder_rejects_data_after_end() {
        let err = Http2FramesWrapper::builder(1)
            .headers(get("/"), true)
            .data(Bytes::from_static(b"late"), true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("after end of stream"));
    }

    #[test]
    fn test_builder_requires_end_of_stream() {
        let err = Http2FramesWrapper::builder(1)
            .headers(get("/"), false)
            .data(Bytes::from_static(b"partial"), false)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not ended"));
    }

    #[test]
    fn test_from_response_without_body() {
        let response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("X-Custom", "1")
            .header("Connection", "close")
            .body(Bytes::new())
            .unwrap();

        let wrapper = Http2FramesWrapper::from_response(3, response);
        assert_eq!(wrapper.frame_count(), 1);
        let headers = wrapper.headers();
        assert!(headers.end_stream);
        assert_eq!(headers.status(), Some(StatusCode::NO_CONTENT));
        assert!(headers.head.headers().contains_key("x-custom"));
        assert!(!headers.head.headers().contains_key("connection"));
    }

    #[test]
    fn test_from_response_with_body() {
        let response = Response::new(Bytes::from_static(b"hello"));
        let wrapper = Http2FramesWrapper::from_response(5, response);
        assert_eq!(wrapper.frame_count(), 2);
        assert!(!wrapper.headers().end_stream);
        assert_eq!(wrapper.body(), Bytes::from_static(b"hello"));
        assert!(wrapper.tail()[0].is_end_stream());
    }

    #[test]
    fn test_to_full_request_uses_https_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "example.com".parse().unwrap());
        let wrapper = Http2FramesWrapper::builder(1)
            .headers(
                Http2Head::Request {
                    method: Method::POST,
                    uri: "/submit?x=1".parse().unwrap(),
                    headers,
                },
                false,
            )
            .data(Bytes::from_static(b"a=1"), false)
            .data(Bytes::from_static(b"&b=2"), true)
            .build()
            .unwrap();

        let request = wrapper.to_full_request().unwrap();
        assert_eq!(request.uri().to_string(), "https://example.com/submit?x=1");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.body(), &Bytes::from_static(b"a=1&b=2"));
    }

    #[test]
    fn test_set_request_path() {
        let mut wrapper = Http2FramesWrapper::builder(1)
            .headers(get("/a;nitmproxy-unsafe=accept"), true)
            .build()
            .unwrap();
        wrapper.set_request_path("/a").unwrap();
        assert_eq!(wrapper.request_path(), Some("/a"));
        assert_eq!(
            wrapper.to_full_request().unwrap().uri().to_string(),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_trailers_are_found() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        let wrapper = Http2FramesWrapper::builder(7)
            .headers(get("/rpc"), false)
            .data(Bytes::from_static(b"x"), false)
            .headers(Http2Head::Trailers(trailers), true)
            .build()
            .unwrap();
        assert_eq!(wrapper.trailers().unwrap()["grpc-status"], "0");
    }

    #[test]
    fn test_full_response_splits_by_frame_size() {
        let response = FullHttp2Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(vec![b'x'; 10]),
        );
        let frames = response.into_frames(1, 4);

        // headers, 4 + 4 + 2, empty end-of-stream
        assert_eq!(frames.len(), 5);
        assert!(matches!(frames[0], Http2Frame::Headers(ref h) if !h.end_stream));
        let sizes: Vec<usize> = frames[1..].iter().map(Http2Frame::data_len).collect();
        assert_eq!(sizes, vec![4, 4, 2, 0]);
        assert!(frames[4].is_end_stream());
        assert!(frames[..4].iter().all(|f| !f.is_end_stream()));
    }
}
