//! Certificate Authority - leaf certificate issuance for intercepted hosts
//!
//! The root certificate and key are read once at startup. Leaf certificates
//! are minted on demand for the hostname a client asked for (SNI or CONNECT
//! target), signed by the root and cached.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::mitm::cert_cache::{CacheStats, CertCache};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name a leaf certificate is issued for; also the cache key
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Lowercased DNS name
    Domain(String),
    /// `*.`-prefixed name, kept as given
    Wildcard(String),
    IpAddress(IpAddr),
    /// `localhost` and loopback addresses share one certificate
    Localhost,
}

impl HostIdentifier {
    pub fn from_hostname(hostname: &str) -> Self {
        let hostname = hostname.trim_start_matches('[').trim_end_matches(']');
        if hostname.eq_ignore_ascii_case("localhost") {
            return Self::Localhost;
        }

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Self::Localhost;
            }
            return Self::IpAddress(ip);
        }

        if hostname.starts_with("*.") {
            return Self::Wildcard(hostname.to_ascii_lowercase());
        }

        Self::Domain(hostname.to_ascii_lowercase())
    }

    fn common_name(&self) -> String {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => name.clone(),
            Self::IpAddress(ip) => ip.to_string(),
            Self::Localhost => "localhost".to_string(),
        }
    }
}

/// A leaf certificate chain (leaf first, then the root) and its private key
#[derive(Debug)]
pub struct IssuedCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl IssuedCertificate {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

struct Signer {
    cert: Certificate,
    key: KeyPair,
    root_der: CertificateDer<'static>,
}

impl Signer {
    fn issue(&self, host: &HostIdentifier) -> Result<IssuedCertificate> {
        let name = host.common_name();
        let fail = |e: rcgen::Error| ProxyError::certificate(name.clone(), e);

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, host.common_name());
        params.subject_alt_names = match host {
            HostIdentifier::Domain(domain) | HostIdentifier::Wildcard(domain) => {
                vec![SanType::DnsName(domain.clone().try_into().map_err(fail)?)]
            }
            HostIdentifier::IpAddress(ip) => vec![SanType::IpAddress(*ip)],
            HostIdentifier::Localhost => vec![
                SanType::DnsName("localhost".to_string().try_into().map_err(fail)?),
                SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ],
        };

        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(serial_number());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate().map_err(fail)?;
        let cert = params.signed_by(&key, &self.cert, &self.key).map_err(fail)?;

        Ok(IssuedCertificate::new(
            vec![cert.der().clone(), self.root_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ))
    }
}

/// 128-bit positive serial: issue time in milliseconds, then random bytes
fn serial_number() -> SerialNumber {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&chrono::Utc::now().timestamp_millis().to_be_bytes());
    rand::thread_rng().fill(&mut bytes[8..]);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Certificate Authority - issues and caches leaf certificates
pub struct CertificateAuthority {
    signer: Arc<Signer>,
    cache: Mutex<CertCache>,
}

impl CertificateAuthority {
    /// Build from PEM encoded root certificate and private key.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        cache_size: usize,
        cert_ttl: Duration,
    ) -> Result<Self> {
        let ca_error = |e: rcgen::Error| ProxyError::certificate("root", e);

        let key = KeyPair::from_pem(key_pem).map_err(ca_error)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(ca_error)?;
        let cert = params.self_signed(&key).map_err(ca_error)?;

        // Present the root exactly as it was loaded
        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::certificate("root", "no certificate in PEM"))??;

        Ok(Self {
            signer: Arc::new(Signer {
                cert,
                key,
                root_der,
            }),
            cache: Mutex::new(CertCache::new(cache_size, cert_ttl)),
        })
    }

    /// Load the root from `cert_path`/`key_path`.
    pub fn load(config: &ProxyConfig) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(&config.cert_path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", config.cert_path, e))
        })?;
        let key_pem = std::fs::read_to_string(&config.key_path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", config.key_path, e))
        })?;

        info!(cert = %config.cert_path, "Loaded root certificate");
        Self::from_pem(
            &cert_pem,
            &key_pem,
            config.cert_cache_size,
            config.cert_ttl(),
        )
    }

    /// Generate a fresh self-signed root. Returns the authority with its
    /// certificate and key PEM so callers can install the root as trusted.
    pub fn generate(
        common_name: &str,
        cache_size: usize,
        cert_ttl: Duration,
    ) -> Result<(Self, String, String)> {
        let ca_error = |e: rcgen::Error| ProxyError::certificate(common_name, e);

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.to_string());
        params
            .distinguished_name
            .push(DnType::OrganizationName, "nitmproxy".to_string());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let key = KeyPair::generate().map_err(ca_error)?;
        let cert = params.self_signed(&key).map_err(ca_error)?;
        let (cert_pem, key_pem) = (cert.pem(), key.serialize_pem());

        let authority = Self::from_pem(&cert_pem, &key_pem, cache_size, cert_ttl)?;
        Ok((authority, cert_pem, key_pem))
    }

    /// Root certificate as presented in issued chains
    pub fn root_der(&self) -> CertificateDer<'static> {
        self.signer.root_der.clone()
    }

    /// Certificate for `hostname`, issued on a cache miss. Key generation
    /// runs on the blocking pool.
    pub async fn get_cert(&self, hostname: &str) -> Result<Arc<IssuedCertificate>> {
        let host = HostIdentifier::from_hostname(hostname);

        if let Some(cert) = self.cache.lock().await.get(&host) {
            debug!(host = ?host, "Certificate cache hit");
            return Ok(cert);
        }

        debug!(host = ?host, "Issuing new certificate");
        let signer = Arc::clone(&self.signer);
        let target = host.clone();
        let issued = tokio::task::spawn_blocking(move || signer.issue(&target))
            .await
            .map_err(|e| ProxyError::certificate(hostname, e))??;

        let issued = Arc::new(issued);
        self.cache.lock().await.insert(host, Arc::clone(&issued));
        Ok(issued)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }
}
