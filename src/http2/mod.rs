//! HTTP/2 proxying
//!
//! Two independent `h2` connections are bridged stream by stream: the
//! client-facing one (proxy acting as server) and the server-facing one
//! (proxy acting as client). Each side numbers its streams on its own;
//! [`StreamIdMap`] keeps the correspondence.

pub mod collector;
pub mod encoding;
mod engine;
pub mod frames;
pub mod stream_map;

pub use collector::FrameCollector;
pub use encoding::ContentEncoding;
pub use engine::Http2ProxyEngine;
pub use frames::{
    FullHttp2Response, Http2Data, Http2Frame, Http2FramesWrapper, Http2Head, Http2Headers,
};
pub use stream_map::StreamIdMap;

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings applied to both h2 connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    /// Per-stream flow control window
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_concurrent_streams: u32,
    /// Also the chunk size when an intercepted body is re-split into frames
    pub max_frame_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 65_535,
            initial_connection_window_size: 1 << 20,
            max_concurrent_streams: 100,
            max_frame_size: 16_384,
        }
    }
}

/// Failure on one of the two h2 connections, tagged with what was underway
#[derive(Debug, Error)]
pub enum H2Error {
    #[error("client connection: {0} failed: {1}")]
    Client(&'static str, #[source] h2::Error),

    #[error("server connection: {0} failed: {1}")]
    Server(&'static str, #[source] h2::Error),

    #[error("stream body: {0}")]
    Body(#[source] h2::Error),
}

impl From<H2Error> for ProxyError {
    fn from(e: H2Error) -> Self {
        ProxyError::Http2(e.to_string())
    }
}
