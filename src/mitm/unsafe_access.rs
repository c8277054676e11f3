//! Unsafe access handling
//!
//! When upstream certificate validation fails the connection is not simply
//! dropped: the configured [`UnsafeAccess`] policy decides. `Ask` hands the
//! decision to an [`UnsafeAccessSupport`], whose default implementation
//! lets the proxy finish the handshake and then answers every request to
//! that server with an HTML page linking to an accept and a deny URL.

use crate::address::Address;
use crate::context::ConnectionContext;
use crate::error::{ProxyError, Result};
use crate::http2::{Http2FramesWrapper, Http2Head};
use crate::listener::{ListenerStore, ProxyListener};
use async_trait::async_trait;
use bytes::Bytes;
use clap::ValueEnum;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub const ACCEPT_SUFFIX: &str = ";nitmproxy-unsafe=accept";
pub const DENY_SUFFIX: &str = ";nitmproxy-unsafe=deny";

const DEFAULT_ASK_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Unsafe connection</title></head>
<body>
<h1>The certificate of this site could not be verified</h1>
<p>The connection may be intercepted or the server may be misconfigured.</p>
<p><a href="{accept}">Continue anyway</a></p>
<p><a href="{deny}">Go back to safety</a></p>
</body>
</html>
"#;

/// Policy applied when the upstream certificate fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnsafeAccess {
    /// Continue the handshake
    Accept,
    /// Fail the handshake
    Deny,
    /// Let the user decide
    Ask,
}

impl FromStr for UnsafeAccess {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "deny" => Ok(Self::Deny),
            "ask" => Ok(Self::Ask),
            other => Err(anyhow::anyhow!(
                "Invalid unsafe access policy '{}'. Must be 'accept', 'deny', or 'ask'",
                other
            )),
        }
    }
}

impl fmt::Display for UnsafeAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accept => "accept",
            Self::Deny => "deny",
            Self::Ask => "ask",
        };
        f.write_str(name)
    }
}

/// Decides what happens to a connection whose upstream certificate failed
/// validation under the `Ask` policy.
pub trait UnsafeAccessSupport: Send + Sync + 'static {
    fn check_unsafe_access(
        &self,
        ctx: &ConnectionContext,
        chain: &[CertificateDer<'_>],
        cause: &rustls::Error,
    ) -> UnsafeAccess;

    /// Register the listeners this support needs
    #[allow(unused_variables)]
    fn install(&self, store: &mut ListenerStore) {}
}

type Decisions = Arc<Mutex<HashMap<Address, UnsafeAccess>>>;

fn lock(decisions: &Decisions) -> MutexGuard<'_, HashMap<Address, UnsafeAccess>> {
    decisions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remembers one decision per server address. Servers start in `Ask` and
/// move to `Accept` or `Deny` when the user follows a link of the ask page.
#[derive(Clone)]
pub struct SimpleUnsafeAccessSupport {
    decisions: Decisions,
    template: Arc<str>,
}

impl Default for SimpleUnsafeAccessSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleUnsafeAccessSupport {
    pub fn new() -> Self {
        Self::with_template(DEFAULT_ASK_TEMPLATE)
    }

    /// `template` is an HTML page with `{accept}` and `{deny}` placeholders
    pub fn with_template(template: impl Into<Arc<str>>) -> Self {
        Self {
            decisions: Arc::new(Mutex::new(HashMap::new())),
            template: template.into(),
        }
    }

    pub fn decision(&self, address: &Address) -> Option<UnsafeAccess> {
        lock(&self.decisions).get(address).copied()
    }

    pub fn interceptor(&self) -> UnsafeAccessInterceptor {
        UnsafeAccessInterceptor {
            decisions: self.decisions.clone(),
            template: self.template.clone(),
        }
    }
}

impl fmt::Debug for SimpleUnsafeAccessSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleUnsafeAccessSupport")
            .field("decisions", &lock(&self.decisions).len())
            .finish()
    }
}

impl UnsafeAccessSupport for SimpleUnsafeAccessSupport {
    fn check_unsafe_access(
        &self,
        ctx: &ConnectionContext,
        _chain: &[CertificateDer<'_>],
        _cause: &rustls::Error,
    ) -> UnsafeAccess {
        let Some(server) = ctx.server_addr() else {
            return UnsafeAccess::Deny;
        };
        *lock(&self.decisions)
            .entry(server)
            .or_insert(UnsafeAccess::Ask)
    }

    fn install(&self, store: &mut ListenerStore) {
        store.add_last(self.interceptor());
    }
}

/// What to do with a request bound to a server pending a decision
enum Verdict {
    Pass,
    Deny,
    Ask(String),
}

/// Answers requests to servers with an unsafe certificate
pub struct UnsafeAccessInterceptor {
    decisions: Decisions,
    template: Arc<str>,
}

impl UnsafeAccessInterceptor {
    /// Applies the stored decision for the context's server to `path`,
    /// stripping the accept suffix in place.
    fn judge(&self, ctx: &ConnectionContext, path: &mut String) -> Verdict {
        let Some(server) = ctx.server_addr() else {
            return Verdict::Pass;
        };
        let mut decisions = lock(&self.decisions);
        match decisions.get(&server).copied() {
            None | Some(UnsafeAccess::Accept) => Verdict::Pass,
            Some(UnsafeAccess::Deny) => Verdict::Deny,
            Some(UnsafeAccess::Ask) => {
                if path.ends_with(ACCEPT_SUFFIX) {
                    *path = path.replace(ACCEPT_SUFFIX, "");
                    decisions.insert(server, UnsafeAccess::Accept);
                    debug!("{} : unsafe access accepted", ctx);
                    Verdict::Pass
                } else if path.ends_with(DENY_SUFFIX) {
                    decisions.insert(server, UnsafeAccess::Deny);
                    debug!("{} : unsafe access denied", ctx);
                    Verdict::Deny
                } else {
                    Verdict::Ask(path.clone())
                }
            }
        }
    }

    fn deny_response() -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::FORBIDDEN;
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, http::HeaderValue::from_static("0"));
        response
    }

    fn ask_response(&self, uri: &str) -> Response<Bytes> {
        let page = self
            .template
            .replace("{accept}", &format!("{}{}", uri, ACCEPT_SUFFIX))
            .replace("{deny}", &format!("{}{}", uri, DENY_SUFFIX));
        let body = Bytes::from(page);
        let mut response = Response::new(body.clone());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, http::HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_LENGTH, http::HeaderValue::from(body.len()));
        response
    }

    fn answer(&self, verdict: Verdict) -> Option<Response<Bytes>> {
        match verdict {
            Verdict::Pass => None,
            Verdict::Deny => Some(Self::deny_response()),
            Verdict::Ask(uri) => Some(self.ask_response(&uri)),
        }
    }
}

#[async_trait]
impl ProxyListener for UnsafeAccessInterceptor {
    async fn on_http1_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Request<Bytes>,
    ) -> Result<Option<Response<Bytes>>> {
        let mut uri = request.uri().to_string();
        let verdict = self.judge(ctx, &mut uri);
        if matches!(verdict, Verdict::Pass) && uri != request.uri().to_string() {
            *request.uri_mut() = uri
                .parse()
                .map_err(|e| ProxyError::protocol(format!("Invalid uri {}: {}", uri, e)))?;
        }
        Ok(self.answer(verdict))
    }

    async fn on_http2_request(
        &self,
        ctx: &ConnectionContext,
        request: &mut Http2FramesWrapper,
    ) -> Result<Option<Http2FramesWrapper>> {
        let Some(path) = request.request_path().map(str::to_string) else {
            return Ok(None);
        };
        let mut rewritten = path.clone();
        let verdict = self.judge(ctx, &mut rewritten);
        if matches!(verdict, Verdict::Pass) && rewritten != path {
            request.set_request_path(&rewritten)?;
        }
        Ok(self
            .answer(verdict)
            .map(|response| Http2FramesWrapper::from_response(request.stream_id(), response)))
    }
}

/// Wraps the real upstream verifier and applies the unsafe access policy
/// when it rejects a certificate.
pub struct UnsafeAccessVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    policy: UnsafeAccess,
    support: Arc<dyn UnsafeAccessSupport>,
    ctx: ConnectionContext,
}

impl UnsafeAccessVerifier {
    pub fn new(
        inner: Arc<dyn ServerCertVerifier>,
        policy: UnsafeAccess,
        support: Arc<dyn UnsafeAccessSupport>,
        ctx: ConnectionContext,
    ) -> Self {
        Self {
            inner,
            policy,
            support,
            ctx,
        }
    }
}

impl fmt::Debug for UnsafeAccessVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsafeAccessVerifier")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish()
    }
}

impl ServerCertVerifier for UnsafeAccessVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cause = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => return Ok(verified),
            Err(e) => e,
        };

        match self.policy {
            UnsafeAccess::Accept => {
                warn!("{} : accepting untrusted certificate: {}", self.ctx, cause);
                Ok(ServerCertVerified::assertion())
            }
            UnsafeAccess::Deny => Err(cause),
            UnsafeAccess::Ask => {
                let mut chain = Vec::with_capacity(intermediates.len() + 1);
                chain.push(end_entity.clone());
                chain.extend(intermediates.iter().cloned());
                match self.support.check_unsafe_access(&self.ctx, &chain, &cause) {
                    UnsafeAccess::Accept => Ok(ServerCertVerified::assertion()),
                    UnsafeAccess::Deny => Err(cause),
                    UnsafeAccess::Ask => {
                        self.ctx.tls_ctx().ask_unsafe_access();
                        Ok(ServerCertVerified::assertion())
                    }
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
