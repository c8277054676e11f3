//! Issued leaf certificates keyed by host, so repeated handshakes for the
//! same name skip key generation.

use crate::mitm::certificate_authority::{HostIdentifier, IssuedCertificate};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FALLBACK_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Cache occupancy and effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Share of lookups answered from the cache, 0 before any lookup
    pub fn hit_ratio(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }
}

/// LRU of issued certificates; entries older than the ttl are reissued
pub struct CertCache {
    entries: LruCache<HostIdentifier, (Instant, Arc<IssuedCertificate>)>,
    ttl: Duration,
    stats: CacheStats,
}

impl CertCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(FALLBACK_CAPACITY);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            stats: CacheStats {
                capacity: capacity.get(),
                ..CacheStats::default()
            },
        }
    }

    /// Stale entries are evicted on lookup and count as a miss.
    pub fn get(&mut self, host: &HostIdentifier) -> Option<Arc<IssuedCertificate>> {
        let fresh = self
            .entries
            .get(host)
            .map(|(issued_at, cert)| (issued_at.elapsed() <= self.ttl, Arc::clone(cert)));

        match fresh {
            Some((true, cert)) => {
                self.stats.hits += 1;
                Some(cert)
            }
            stale => {
                if stale.is_some() {
                    self.entries.pop(host);
                }
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, host: HostIdentifier, cert: Arc<IssuedCertificate>) {
        self.entries.put(host, (Instant::now(), cert));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            ..self.stats
        }
    }
}
