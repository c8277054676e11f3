//! Proxy-wide services shared by every connection

use crate::config::ProxyConfig;
use crate::context::{Connector, TcpConnector};
use crate::error::Result;
use crate::listener::{ListenerManager, ListenerStore};
use crate::mitm::{CertificateAuthority, SimpleUnsafeAccessSupport, UnsafeAccess, UnsafeAccessSupport};
use std::fmt;
use std::sync::Arc;

/// Configuration, root CA, listeners and outbound connector. Built once at
/// startup and shared by all connections.
pub struct ProxyMaster {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    listener: ListenerManager,
    connector: Arc<dyn Connector>,
    unsafe_access_support: Arc<dyn UnsafeAccessSupport>,
}

impl ProxyMaster {
    pub fn builder(config: ProxyConfig) -> ProxyMasterBuilder {
        ProxyMasterBuilder {
            config,
            authority: None,
            store: ListenerStore::new(),
            connector: None,
            unsafe_access_support: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn listener(&self) -> &ListenerManager {
        &self.listener
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    pub fn unsafe_access_support(&self) -> Arc<dyn UnsafeAccessSupport> {
        Arc::clone(&self.unsafe_access_support)
    }
}

impl fmt::Debug for ProxyMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyMaster")
            .field("mode", &self.config.mode)
            .field("listeners", &self.listener.len())
            .finish()
    }
}

pub struct ProxyMasterBuilder {
    config: ProxyConfig,
    authority: Option<Arc<CertificateAuthority>>,
    store: ListenerStore,
    connector: Option<Arc<dyn Connector>>,
    unsafe_access_support: Option<Arc<dyn UnsafeAccessSupport>>,
}

impl ProxyMasterBuilder {
    /// Use this CA instead of loading `cert_path`/`key_path`
    pub fn authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Listeners, in registration order
    pub fn listeners(mut self, store: ListenerStore) -> Self {
        self.store = store;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn unsafe_access_support(mut self, support: Arc<dyn UnsafeAccessSupport>) -> Self {
        self.unsafe_access_support = Some(support);
        self
    }

    pub fn build(self) -> Result<ProxyMaster> {
        let Self {
            config,
            authority,
            mut store,
            connector,
            unsafe_access_support,
        } = self;

        let authority = match authority {
            Some(authority) => authority,
            None => Arc::new(CertificateAuthority::load(&config)?),
        };
        let connector =
            connector.unwrap_or_else(|| Arc::new(TcpConnector::new(config.connect_timeout())));
        let support = unsafe_access_support
            .unwrap_or_else(|| Arc::new(SimpleUnsafeAccessSupport::new()));
        if config.unsafe_access == UnsafeAccess::Ask && !config.insecure {
            support.install(&mut store);
        }

        Ok(ProxyMaster {
            listener: ListenerManager::new(&store),
            config,
            authority,
            connector,
            unsafe_access_support: support,
        })
    }
}
