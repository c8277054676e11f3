//! Per-connection TLS negotiation state

use crate::context::promise::Promise;
use crate::error::Result;
use crate::mitm::UnsafeAccess;
use std::sync::Mutex;

pub const HTTP_1_1: &str = "http/1.1";
pub const H2: &str = "h2";
/// Pseudo protocol selecting the raw forward engine
pub const FORWARD: &str = "forward";

struct TlsState {
    enabled: bool,
    unsafe_access: UnsafeAccess,
    protocols: Promise<Vec<String>>,
    protocol: Promise<String>,
}

impl TlsState {
    fn fresh_promises() -> (Promise<Vec<String>>, Promise<String>) {
        (
            Promise::new("Alpn protocols"),
            Promise::new("Alpn protocol"),
        )
    }
}

/// TLS state of one connection.
///
/// `protocols` is the ALPN list the client offered, `protocol` the value
/// finally negotiated. Both are write-once and replaced whenever a new
/// outbound connection is opened.
pub struct TlsContext {
    state: Mutex<TlsState>,
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsContext {
    pub fn new() -> Self {
        let (protocols, protocol) = TlsState::fresh_promises();
        Self {
            state: Mutex::new(TlsState {
                enabled: true,
                unsafe_access: UnsafeAccess::Accept,
                protocols,
                protocol,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TlsState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|s| s.enabled)
    }

    /// Plaintext connection: ALPN settles to an empty offer and `protocol`.
    /// Values settled earlier are kept.
    pub fn disable_tls(&self, protocol: &str) {
        let (protocols, negotiated) = self.with_state(|s| {
            s.enabled = false;
            (s.protocols.clone(), s.protocol.clone())
        });
        let _ = protocols.resolve(Vec::new());
        let _ = negotiated.resolve(protocol.to_string());
    }

    /// ALPN protocols the client offered. Errors before the ClientHello
    /// has been read.
    pub fn protocols(&self) -> Result<Vec<String>> {
        self.protocols_promise().get()
    }

    pub fn protocols_promise(&self) -> Promise<Vec<String>> {
        self.with_state(|s| s.protocols.clone())
    }

    /// Negotiated protocol. Errors before negotiation completed.
    pub fn protocol(&self) -> Result<String> {
        self.protocol_promise().get()
    }

    pub fn protocol_promise(&self) -> Promise<String> {
        self.with_state(|s| s.protocol.clone())
    }

    pub fn is_negotiated(&self) -> bool {
        self.protocol_promise().is_success()
    }

    /// Install fresh promises for a new outbound connection. Pending
    /// waiters on the old ones are failed so nothing hangs.
    pub fn reset_negotiation(&self) {
        let (old_protocols, old_protocol) = self.with_state(|s| {
            let (protocols, protocol) = TlsState::fresh_promises();
            (
                std::mem::replace(&mut s.protocols, protocols),
                std::mem::replace(&mut s.protocol, protocol),
            )
        });
        let _ = old_protocols.fail("superseded by a new connection");
        let _ = old_protocol.fail("superseded by a new connection");
    }

    pub fn unsafe_access(&self) -> UnsafeAccess {
        self.with_state(|s| s.unsafe_access)
    }

    pub fn ask_unsafe_access(&self) {
        self.with_state(|s| s.unsafe_access = UnsafeAccess::Ask);
    }

    pub fn is_ask(&self) -> bool {
        self.unsafe_access() == UnsafeAccess::Ask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;

    #[test]
    fn test_read_before_settlement_fails() {
        let tls = TlsContext::new();
        assert!(matches!(tls.protocols(), Err(ProxyError::NotResolved(_))));
        assert!(matches!(tls.protocol(), Err(ProxyError::NotResolved(_))));
        assert!(!tls.is_negotiated());
    }

    #[test]
    fn test_disable_tls_settles_both() {
        let tls = TlsContext::new();
        tls.disable_tls(HTTP_1_1);
        assert!(!tls.is_enabled());
        assert!(tls.protocols().unwrap().is_empty());
        assert_eq!(tls.protocol().unwrap(), HTTP_1_1);
    }

    #[test]
    fn test_disable_tls_keeps_negotiated_protocol() {
        let tls = TlsContext::new();
        tls.protocol_promise().resolve(H2.to_string()).unwrap();
        tls.disable_tls(HTTP_1_1);
        assert_eq!(tls.protocol().unwrap(), H2);
    }

    #[tokio::test]
    async fn test_reset_replaces_and_fails_stale_promises() {
        let tls = TlsContext::new();
        let stale = tls.protocol_promise();
        tls.reset_negotiation();

        assert!(matches!(stale.wait().await, Err(ProxyError::Abandoned(..))));
        assert!(!tls.protocol_promise().is_done());
    }

    #[test]
    fn test_unsafe_access_ask() {
        let tls = TlsContext::new();
        assert_eq!(tls.unsafe_access(), UnsafeAccess::Accept);
        tls.ask_unsafe_access();
        assert!(tls.is_ask());
    }
}
