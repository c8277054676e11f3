//! Per-stream frame accumulation

use crate::context::ConnectionContext;
use crate::error::{ProxyError, Result};
use crate::event::{HttpEvent, HttpEventBuilder};
use crate::http2::frames::{Http2Frame, Http2FramesWrapper, Http2Head};
use chrono::Utc;
use http::{header, Version};

/// Collects one stream's request frames into a message and tracks the
/// response for telemetry.
#[derive(Debug)]
pub struct FrameCollector {
    stream_id: u32,
    request_frames: Vec<Http2Frame>,
    request_done: bool,
    response_done: bool,
    event: HttpEventBuilder,
}

impl FrameCollector {
    pub fn new(ctx: &ConnectionContext, stream_id: u32) -> Self {
        let mut event = HttpEvent::builder(ctx);
        event.version(Version::HTTP_2);
        Self {
            stream_id,
            request_frames: Vec::new(),
            request_done: false,
            response_done: false,
            event,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Add a request frame. Returns the complete request exactly once,
    /// when the end-of-stream frame arrives.
    pub fn on_request_frame(&mut self, frame: Http2Frame) -> Result<Option<Http2FramesWrapper>> {
        if self.request_done {
            return Err(ProxyError::protocol(format!(
                "request frame after end of stream {}",
                self.stream_id
            )));
        }

        match &frame {
            Http2Frame::Headers(headers) => {
                if let Http2Head::Request {
                    method,
                    uri,
                    headers,
                } = &headers.head
                {
                    let host = uri
                        .host()
                        .map(str::to_string)
                        .or_else(|| {
                            headers
                                .get(header::HOST)
                                .and_then(|h| h.to_str().ok())
                                .map(str::to_string)
                        })
                        .unwrap_or_default();
                    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                    self.event
                        .method(method.clone())
                        .host(host)
                        .path(path)
                        .request_time(Utc::now());
                }
            }
            Http2Frame::Data(data) => {
                self.event.add_request_body_size(data.data.len() as u64);
            }
        }

        let end_stream = frame.is_end_stream();
        self.request_frames.push(frame);
        if !end_stream {
            return Ok(None);
        }

        self.request_done = true;
        let mut builder = Http2FramesWrapper::builder(self.stream_id);
        for frame in std::mem::take(&mut self.request_frames) {
            builder = builder.frame(frame);
        }
        builder.build().map(Some)
    }

    /// Track a response frame on its way to the client. Returns true once
    /// the response ended.
    pub fn on_response_frame(&mut self, frame: &Http2Frame) -> bool {
        match frame {
            Http2Frame::Headers(headers) => {
                if let Http2Head::Response { status, headers } = &headers.head {
                    self.event
                        .response_head(*status, headers)
                        .response_time(Utc::now());
                }
            }
            Http2Frame::Data(data) => {
                self.event.add_response_body_size(data.data.len() as u64);
            }
        }
        if frame.is_end_stream() {
            self.response_done = true;
        }
        self.response_done
    }

    pub fn is_request_done(&self) -> bool {
        self.request_done
    }

    pub fn is_response_done(&self) -> bool {
        self.response_done
    }

    pub fn build_event(&self) -> HttpEvent {
        self.event.build()
    }
}
