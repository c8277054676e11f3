//! Address resolution
//!
//! Turns `host[:port]` strings and absolute `http(s)://` URLs into
//! `(host, port)` endpoints. Every front end goes through these helpers
//! before handing a destination to the connection context.

use crate::error::{ProxyError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref ADDRESS_PATTERN: Regex =
        Regex::new(r"^(?:\[([0-9a-fA-F:.]+)\]|([a-zA-Z0-9.\-_]+))(?::(\d+))?").expect("address pattern");
    static ref URL_PATTERN: Regex =
        Regex::new(r"^(https?)://(?:\[([0-9a-fA-F:.]+)\]|([a-zA-Z0-9.\-]+))(?::(\d+))?(/.*)?$")
            .expect("url pattern");
}

/// A host and port endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. The port is mandatory.
    pub fn resolve(address: &str) -> Result<Self> {
        let (host, port) = Self::parse(address)?;
        let port = port.ok_or_else(|| ProxyError::InvalidAddress(address.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Parse `host[:port]`, falling back to `default_port` when absent.
    pub fn resolve_with_default(address: &str, default_port: u16) -> Result<Self> {
        let (host, port) = Self::parse(address)?;
        Ok(Self::new(host, port.unwrap_or(default_port)))
    }

    fn parse(address: &str) -> Result<(String, Option<u16>)> {
        let caps = ADDRESS_PATTERN
            .captures(address.trim())
            .ok_or_else(|| ProxyError::InvalidAddress(address.to_string()))?;

        let host = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ProxyError::InvalidAddress(address.to_string()))?;

        let port = match caps.get(3) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| ProxyError::InvalidAddress(address.to_string()))?,
            ),
            None => None,
        };

        Ok((host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// String usable with `TcpStream::connect`
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An absolute `http://` or `https://` URL split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl HttpUrl {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Parse an absolute URL. Port defaults to 443 for https and 80 for http.
    pub fn resolve(uri: &str) -> Result<Self> {
        let caps = URL_PATTERN
            .captures(uri)
            .ok_or_else(|| ProxyError::InvalidUrl(uri.to_string()))?;

        let scheme = caps[1].to_string();
        let host = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ProxyError::InvalidUrl(uri.to_string()))?;
        let port = match caps.get(4) {
            Some(m) => m
                .as_str()
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidUrl(uri.to_string()))?,
            None => Self::default_port(&scheme),
        };
        let path = caps.get(5).map(|m| m.as_str()).unwrap_or("/").to_string();

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    fn default_port(scheme: &str) -> u16 {
        if scheme == "https" {
            443
        } else {
            80
        }
    }

    pub fn scheme_for(tls_enabled: bool) -> &'static str {
        if tls_enabled {
            "https"
        } else {
            "http"
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}
