//! TLS interception
//!
//! This module provides:
//! - Root certificate handling and on-demand leaf issuance
//! - ClientHello sniffing (SNI, ALPN offer)
//! - Client-facing and upstream TLS configuration
//! - The per-connection negotiation state machine
//! - The unsafe access policy for upstream certificates that fail
//!   validation

pub mod cert_cache;
pub mod certificate_authority;
pub mod client_hello;
pub mod negotiator;
pub mod tls_config;
pub mod unsafe_access;

// Re-export main types
pub use cert_cache::CacheStats;
pub use certificate_authority::{CertificateAuthority, HostIdentifier, IssuedCertificate};
pub use client_hello::ClientHello;
pub use negotiator::{ClientStart, Negotiated, TlsNegotiator};
pub use tls_config::{LeafSource, TlsSetupError};
pub use unsafe_access::{
    SimpleUnsafeAccessSupport, UnsafeAccess, UnsafeAccessInterceptor, UnsafeAccessSupport,
    UnsafeAccessVerifier,
};
