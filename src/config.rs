use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use rustls::client::danger::ServerCertVerifier;
use rustls::server::ResolvesServerCert;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::ProtocolDetector;
use crate::http2::Http2Config;
use crate::mitm::UnsafeAccess;

/// How clients address the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Classic HTTP proxy: `CONNECT host:port` or absolute-URI requests
    Http,
    /// SOCKS4/4a and SOCKS5 CONNECT
    Socks,
    /// Redirected traffic; the destination comes from SNI or `Host`
    Transparent,
}

impl FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "socks" => Ok(Self::Socks),
            "transparent" => Ok(Self::Transparent),
            other => Err(anyhow::anyhow!(
                "Invalid proxy mode '{}'. Must be 'http', 'socks', or 'transparent'",
                other
            )),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Socks => "socks",
            Self::Transparent => "transparent",
        };
        f.write_str(name)
    }
}

/// Proxy configuration consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,

    // Listener
    pub host: String,
    pub port: u16,

    // CA certificate and key (PEM)
    pub cert_path: String,
    pub key_path: String,

    /// Skip upstream certificate validation entirely
    pub insecure: bool,

    /// Allowed TLS versions, e.g. `TLSv1.3`, `TLSv1.2`
    pub tls_protocols: Vec<String>,

    /// Largest aggregated HTTP/1 body, and largest decoded HTTP/2 body
    /// handed to listeners, in bytes
    pub max_content_length: usize,

    /// Policy applied when upstream certificate validation fails
    pub unsafe_access: UnsafeAccess,

    pub connect_timeout_seconds: u64,

    // Leaf certificate cache
    pub cert_cache_size: usize,
    pub cert_ttl_seconds: u64,

    pub http2: Http2Config,

    /// Plaintext protocol detectors, tried in order
    pub detectors: Vec<ProtocolDetector>,

    /// Replaces the default upstream certificate verifier
    #[serde(skip)]
    pub trust_override: Option<Arc<dyn ServerCertVerifier>>,

    /// Replaces leaf certificate issuance for client-facing handshakes
    #[serde(skip)]
    pub cert_resolver_override: Option<Arc<dyn ResolvesServerCert>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Http,
            host: "127.0.0.1".to_string(),
            port: 8080,
            cert_path: "server.pem".to_string(),
            key_path: "key.pem".to_string(),
            insecure: false,
            tls_protocols: vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()],
            max_content_length: 50 * 1024 * 1024,
            unsafe_access: UnsafeAccess::Deny,
            connect_timeout_seconds: 10,
            cert_cache_size: 1000,
            cert_ttl_seconds: 86400,
            http2: Http2Config::default(),
            detectors: vec![ProtocolDetector::Http1],
            trust_override: None,
            cert_resolver_override: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from `NITMPROXY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: ProxyConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = env::var("NITMPROXY_MODE") {
            self.mode = mode.parse().context("Invalid NITMPROXY_MODE")?;
        }
        if let Ok(host) = env::var("NITMPROXY_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("NITMPROXY_PORT") {
            self.port = port.parse().context("Invalid NITMPROXY_PORT")?;
        }
        if let Ok(cert) = env::var("NITMPROXY_CERT") {
            self.cert_path = cert;
        }
        if let Ok(key) = env::var("NITMPROXY_KEY") {
            self.key_path = key;
        }
        if let Ok(insecure) = env::var("NITMPROXY_INSECURE") {
            self.insecure = insecure.parse().context("Invalid NITMPROXY_INSECURE")?;
        }
        if let Ok(protocols) = env::var("NITMPROXY_TLS_PROTOCOLS") {
            self.tls_protocols = protocols
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Ok(max) = env::var("NITMPROXY_MAX_CONTENT_LENGTH") {
            self.max_content_length = max
                .parse()
                .context("Invalid NITMPROXY_MAX_CONTENT_LENGTH")?;
        }
        if let Ok(policy) = env::var("NITMPROXY_UNSAFE_ACCESS") {
            self.unsafe_access = policy.parse().context("Invalid NITMPROXY_UNSAFE_ACCESS")?;
        }
        if let Ok(timeout) = env::var("NITMPROXY_CONNECT_TIMEOUT_SECONDS") {
            self.connect_timeout_seconds = timeout
                .parse()
                .context("Invalid NITMPROXY_CONNECT_TIMEOUT_SECONDS")?;
        }
        if let Ok(size) = env::var("NITMPROXY_CERT_CACHE_SIZE") {
            self.cert_cache_size = size.parse().context("Invalid NITMPROXY_CERT_CACHE_SIZE")?;
        }
        if let Ok(ttl) = env::var("NITMPROXY_CERT_TTL_SECONDS") {
            self.cert_ttl_seconds = ttl.parse().context("Invalid NITMPROXY_CERT_TTL_SECONDS")?;
        }

        self.validate()
    }

    /// Apply command line overrides on top of file/env configuration.
    pub fn apply_cli(&mut self, args: &CliArgs) -> Result<()> {
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(cert) = &args.cert {
            self.cert_path = cert.clone();
        }
        if let Some(key) = &args.key {
            self.key_path = key.clone();
        }
        if args.insecure {
            self.insecure = true;
        }
        if !args.tls.is_empty() {
            self.tls_protocols = args.tls.clone();
        }
        if let Some(max) = args.max_length {
            self.max_content_length = max;
        }
        if let Some(policy) = args.unsafe_access {
            self.unsafe_access = policy;
        }

        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.tls_protocols.is_empty() {
            return Err(anyhow::anyhow!("At least one TLS protocol must be enabled"));
        }
        for protocol in &self.tls_protocols {
            if !["TLSv1.2", "TLSv1.3"].contains(&protocol.as_str()) {
                return Err(anyhow::anyhow!(
                    "Unsupported TLS protocol '{}'. Must be 'TLSv1.2' or 'TLSv1.3'",
                    protocol
                ));
            }
        }
        if self.max_content_length == 0 {
            return Err(anyhow::anyhow!("max_content_length must be greater than zero"));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn cert_ttl(&self) -> Duration {
        Duration::from_secs(self.cert_ttl_seconds)
    }
}

/// Command line arguments of the `nitmproxy` binary
#[derive(Debug, Default, Parser)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
pub struct CliArgs {
    /// Proxy mode
    #[arg(short, long, value_enum)]
    pub mode: Option<ProxyMode>,

    /// Listening host
    #[arg(short, long)]
    pub host: Option<String>,

    /// Listening port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// CA certificate (PEM)
    #[arg(long)]
    pub cert: Option<String>,

    /// CA private key (PEM)
    #[arg(long)]
    pub key: Option<String>,

    /// Do not validate upstream certificates
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// Allowed TLS protocols (TLSv1.2, TLSv1.3)
    #[arg(long, num_args = 1..)]
    pub tls: Vec<String>,

    /// Max aggregated content length in bytes
    #[arg(long = "maxlength")]
    pub max_length: Option<usize>,

    /// Policy for upstream certificates that fail validation
    #[arg(long, value_enum)]
    pub unsafe_access: Option<UnsafeAccess>,

    /// YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Env vars are process-global
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_test_env() {
        for var in [
            "NITMPROXY_MODE",
            "NITMPROXY_HOST",
            "NITMPROXY_PORT",
            "NITMPROXY_TLS_PROTOCOLS",
            "NITMPROXY_MAX_CONTENT_LENGTH",
            "NITMPROXY_UNSAFE_ACCESS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.mode, ProxyMode::Http);
        assert_eq!(config.listen_address(), "127.0.0.1:8080");
        assert_eq!(config.tls_protocols, vec!["TLSv1.3", "TLSv1.2"]);
        assert_eq!(config.max_content_length, 50 * 1024 * 1024);
        assert_eq!(config.unsafe_access, UnsafeAccess::Deny);
        assert_eq!(config.detectors, vec![ProtocolDetector::Http1]);
        assert!(!config.insecure);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("NITMPROXY_MODE", "transparent");
        env::set_var("NITMPROXY_PORT", "9090");
        env::set_var("NITMPROXY_TLS_PROTOCOLS", "TLSv1.3");
        env::set_var("NITMPROXY_UNSAFE_ACCESS", "ask");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.mode, ProxyMode::Transparent);
        assert_eq!(config.port, 9090);
        assert_eq!(config.tls_protocols, vec!["TLSv1.3"]);
        assert_eq!(config.unsafe_access, UnsafeAccess::Ask);

        clear_test_env();
    }

    #[test]
    fn test_config_from_env_rejects_invalid_port() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("NITMPROXY_PORT", "not-a-port");

        let err = ProxyConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("Invalid NITMPROXY_PORT"));

        clear_test_env();
    }

    #[test]
    fn test_config_rejects_unknown_tls_protocol() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("NITMPROXY_TLS_PROTOCOLS", "SSLv3");

        assert!(ProxyConfig::from_env().is_err());

        clear_test_env();
    }

    #[test]
    fn test_config_from_yaml_file() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: socks\nport: 1080\nmax_content_length: 1024\ninsecure: true").unwrap();

        let config = ProxyConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.mode, ProxyMode::Socks);
        assert_eq!(config.port, 1080);
        assert_eq!(config.max_content_length, 1024);
        assert!(config.insecure);
        // Untouched fields keep their defaults
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "nitmproxy",
            "-m",
            "transparent",
            "-h",
            "0.0.0.0",
            "-p",
            "8443",
            "-k",
            "--tls",
            "TLSv1.2",
            "--maxlength",
            "2048",
        ]);

        let mut config = ProxyConfig::default();
        config.apply_cli(&args).unwrap();
        assert_eq!(config.mode, ProxyMode::Transparent);
        assert_eq!(config.listen_address(), "0.0.0.0:8443");
        assert!(config.insecure);
        assert_eq!(config.tls_protocols, vec!["TLSv1.2"]);
        assert_eq!(config.max_content_length, 2048);
    }
}
