//! rustls configs for both legs of an intercepted connection
//!
//! The client-facing leg serves an issued leaf certificate; the upstream leg
//! verifies the real server through the unsafe access policy. Each side
//! advertises exactly the ALPN list the negotiator computed.

use crate::error::ProxyError;
use crate::mitm::certificate_authority::IssuedCertificate;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::ServerName;
use rustls::server::ResolvesServerCert;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Cannot build certificate verifier: {0}")]
    Verifier(String),

    #[error("None of {0:?} is a supported TLS version")]
    NoVersions(Vec<String>),

    #[error("{host:?} is not a valid TLS server name")]
    ServerName { host: String },
}

impl From<TlsSetupError> for ProxyError {
    fn from(e: TlsSetupError) -> Self {
        ProxyError::Tls(e.to_string())
    }
}

/// Where the client-facing leg gets its certificate
pub enum LeafSource<'a> {
    Issued(&'a IssuedCertificate),
    Resolver(Arc<dyn ResolvesServerCert>),
}

/// Configured names (`TLSv1.3`, `TLSv1.2`) as rustls versions, deduplicated.
/// Unknown names are skipped with a warning.
pub fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static SupportedProtocolVersion>, TlsSetupError> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    for name in names {
        let normalized = name.to_ascii_lowercase().replace("tlsv", "tls");
        let version = match normalized.as_str() {
            "tls1.3" => &rustls::version::TLS13,
            "tls1.2" => &rustls::version::TLS12,
            _ => {
                warn!(protocol = %name, "Unsupported TLS protocol ignored");
                continue;
            }
        };
        if versions.iter().all(|known| known.version != version.version) {
            versions.push(version);
        }
    }
    match versions.is_empty() {
        true => Err(TlsSetupError::NoVersions(names.to_vec())),
        false => Ok(versions),
    }
}

fn alpn_ids(protocols: &[String]) -> Vec<Vec<u8>> {
    protocols.iter().map(|p| p.clone().into_bytes()).collect()
}

/// WebPKI verification against the Mozilla roots
pub fn default_verifier() -> Result<Arc<dyn ServerCertVerifier>, TlsSetupError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsSetupError::Verifier(e.to_string()))?;
    Ok(verifier)
}

/// Config for accepting the client's handshake
pub fn client_facing(
    leaf: LeafSource<'_>,
    versions: &[String],
    alpn: &[String],
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let builder = ServerConfig::builder_with_protocol_versions(&protocol_versions(versions)?)
        .with_no_client_auth();
    let mut config = match leaf {
        LeafSource::Issued(cert) => builder.with_single_cert(cert.chain(), cert.key())?,
        LeafSource::Resolver(resolver) => builder.with_cert_resolver(resolver),
    };
    config.alpn_protocols = alpn_ids(alpn);
    debug!(alpn = ?alpn, "Client-facing TLS config ready");
    Ok(Arc::new(config))
}

/// Config for the handshake towards the real server
pub fn upstream(
    verifier: Arc<dyn ServerCertVerifier>,
    versions: &[String],
    alpn: &[String],
) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let mut config = ClientConfig::builder_with_protocol_versions(&protocol_versions(versions)?)
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = alpn_ids(alpn);
    debug!(alpn = ?alpn, "Upstream TLS config ready");
    Ok(Arc::new(config))
}

/// SNI for the upstream handshake; IP literals become IP server names
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsSetupError> {
    ServerName::try_from(host.to_owned()).map_err(|_| TlsSetupError::ServerName {
        host: host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::CertificateAuthority;
    use std::time::Duration;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_versions_deduplicated_and_filtered() {
        let versions = protocol_versions(&names(&["TLSv1.3", "TLSv1.2", "tls1.3"])).unwrap();
        assert_eq!(versions.len(), 2);

        let versions = protocol_versions(&names(&["TLSv1", "TLSv1.2"])).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::version::TLS12.version);

        assert!(matches!(
            protocol_versions(&names(&["SSLv3"])),
            Err(TlsSetupError::NoVersions(_))
        ));
    }

    #[test]
    fn test_server_names() {
        assert!(matches!(server_name("example.com"), Ok(ServerName::DnsName(_))));
        assert!(matches!(server_name("192.168.1.1"), Ok(ServerName::IpAddress(_))));
        assert!(server_name("").is_err());
    }

    #[tokio::test]
    async fn test_client_facing_offers_one_protocol() {
        let (ca, _, _) =
            CertificateAuthority::generate("alpn test root", 4, Duration::from_secs(60)).unwrap();
        let cert = ca.get_cert("example.com").await.unwrap();

        let config = client_facing(
            LeafSource::Issued(&cert),
            &names(&["TLSv1.3"]),
            &names(&["h2"]),
        )
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_upstream_mirrors_offer() {
        let config = upstream(
            default_verifier().unwrap(),
            &names(&["TLSv1.3", "TLSv1.2"]),
            &names(&["h2", "http/1.1"]),
        )
        .unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
