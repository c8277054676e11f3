//! Stream id correspondence between the client-facing and the
//! server-facing HTTP/2 connection

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Maps {
    client_to_server: HashMap<u32, u32>,
    server_to_client: HashMap<u32, u32>,
    last_server_id: u32,
}

/// Bijective client id <-> server id map.
///
/// Both directions live behind one mutex so they are always updated
/// together. Server ids are client-initiated (odd) and strictly increasing;
/// the `h2` client allocates them, the map only records and checks them.
#[derive(Debug, Default)]
pub struct StreamIdMap {
    maps: Mutex<Maps>,
}

impl StreamIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `client_id -> server_id`. Stream 0 is never mapped.
    pub fn insert(&self, client_id: u32, server_id: u32) -> Result<()> {
        if client_id == 0 || server_id == 0 {
            return Err(ProxyError::protocol("connection stream 0 cannot be remapped"));
        }
        if server_id % 2 == 0 {
            return Err(ProxyError::protocol(format!(
                "server stream {} is not client-initiated",
                server_id
            )));
        }

        let mut maps = self.lock();
        if server_id <= maps.last_server_id {
            return Err(ProxyError::protocol(format!(
                "server stream {} is not above {}",
                server_id, maps.last_server_id
            )));
        }
        if maps.client_to_server.contains_key(&client_id) {
            return Err(ProxyError::protocol(format!(
                "client stream {} already mapped",
                client_id
            )));
        }

        maps.client_to_server.insert(client_id, server_id);
        maps.server_to_client.insert(server_id, client_id);
        maps.last_server_id = server_id;
        Ok(())
    }

    pub fn server_id(&self, client_id: u32) -> Option<u32> {
        if client_id == 0 {
            return Some(0);
        }
        self.lock().client_to_server.get(&client_id).copied()
    }

    pub fn client_id(&self, server_id: u32) -> Option<u32> {
        if server_id == 0 {
            return Some(0);
        }
        self.lock().server_to_client.get(&server_id).copied()
    }

    /// Client id for a frame on the return path. An unknown server stream
    /// is a protocol error.
    pub fn require_client_id(&self, server_id: u32) -> Result<u32> {
        self.client_id(server_id).ok_or_else(|| {
            ProxyError::protocol(format!("no client stream for server stream {}", server_id))
        })
    }

    /// Remove the entry for a finished stream, keyed by its client id.
    pub fn remove(&self, client_id: u32) -> Option<u32> {
        let mut maps = self.lock();
        let server_id = maps.client_to_server.remove(&client_id)?;
        maps.server_to_client.remove(&server_id);
        Some(server_id)
    }

    pub fn len(&self) -> usize {
        self.lock().client_to_server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_bijective() {
        let map = StreamIdMap::new();
        map.insert(7, 1).unwrap();
        map.insert(3, 3).unwrap();

        assert_eq!(map.server_id(7), Some(1));
        assert_eq!(map.client_id(1), Some(7));
        assert_eq!(map.server_id(3), Some(3));
        assert_eq!(map.client_id(3), Some(3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_stream_zero_is_identity() {
        let map = StreamIdMap::new();
        assert_eq!(map.server_id(0), Some(0));
        assert_eq!(map.client_id(0), Some(0));
        assert!(map.insert(0, 1).is_err());
    }

    #[test]
    fn test_rejects_reuse_and_non_monotonic_ids() {
        let map = StreamIdMap::new();
        map.insert(1, 5).unwrap();
        assert!(map.insert(1, 7).is_err(), "client id reused");
        assert!(map.insert(3, 5).is_err(), "server id reused");
        assert!(map.insert(3, 3).is_err(), "server id went backwards");
        assert!(map.insert(3, 8).is_err(), "even server id");
    }

    #[test]
    fn test_unknown_server_stream_is_error() {
        let map = StreamIdMap::new();
        assert!(map.require_client_id(9).is_err());
    }

    #[test]
    fn test_empty_after_streams_complete() {
        let map = StreamIdMap::new();
        for (i, client_id) in [1u32, 3, 5, 7].into_iter().enumerate() {
            map.insert(client_id, 2 * i as u32 + 1).unwrap();
        }
        for client_id in [5, 1, 7, 3] {
            assert!(map.remove(client_id).is_some());
        }
        assert!(map.is_empty());
        assert_eq!(map.remove(1), None);
    }
}
