//! Proxy error types

use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while proxying a connection.
///
/// Every variant is fatal to the connection it was raised on; nothing is
/// retried inside the core.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// `host[:port]` string could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Absolute URL could not be parsed
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    /// Aggregated message exceeded the configured limit
    #[error("Content too large: {size} bytes exceeds limit of {limit} bytes")]
    ContentTooLarge { size: usize, limit: usize },

    /// Request/response state went out of sync
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Outbound connection could not be established
    #[error("Failed to connect to {address}: {source}")]
    UpstreamConnect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration could not be built
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS handshake failed
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshake { host: String, reason: String },

    /// Upstream certificate rejected by the unsafe access policy
    #[error("Untrusted certificate for {0}")]
    UntrustedCertificate(String),

    /// A negotiation value was read before it was settled
    #[error("{0} not resolved before accessing")]
    NotResolved(&'static str),

    /// A negotiation value was settled twice
    #[error("{0} already resolved")]
    AlreadyResolved(&'static str),

    /// Negotiation was abandoned before it settled
    #[error("{0} abandoned: {1}")]
    Abandoned(&'static str, String),

    /// Leaf certificate issuance failed
    #[error("Certificate error for {host}: {reason}")]
    Certificate { host: String, reason: String },

    /// HTTP/2 engine failure
    #[error("HTTP/2 error: {0}")]
    Http2(String),

    /// WebSocket relay failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a TLS configuration error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::TlsHandshake {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a certificate issuance error
    pub fn certificate(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Certificate {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an upstream connect error
    pub fn upstream_connect(address: impl ToString, source: std::io::Error) -> Self {
        Self::UpstreamConnect {
            address: address.to_string(),
            source,
        }
    }

    /// True for errors caused by the peer simply going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_resolved_message() {
        let err = ProxyError::NotResolved("Alpn protocols");
        assert_eq!(err.to_string(), "Alpn protocols not resolved before accessing");
    }

    #[test]
    fn test_disconnect_detection() {
        let reset = ProxyError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        assert!(!ProxyError::protocol("no request").is_disconnect());
    }
}
