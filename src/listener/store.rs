//! Ordered listener registration

use crate::error::{ProxyError, Result};
use crate::listener::ProxyListener;
use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

struct Entry {
    type_id: TypeId,
    name: &'static str,
    listener: Arc<dyn ProxyListener>,
}

/// Listeners in registration order, addressed by their concrete type
#[derive(Default)]
pub struct ListenerStore {
    entries: Vec<Entry>,
}

impl ListenerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry<L: ProxyListener>(listener: L) -> Entry {
        Entry {
            type_id: TypeId::of::<L>(),
            name: type_name::<L>(),
            listener: Arc::new(listener),
        }
    }

    fn position<T: ProxyListener>(&self) -> Result<usize> {
        self.entries
            .iter()
            .position(|entry| entry.type_id == TypeId::of::<T>())
            .ok_or_else(|| {
                ProxyError::Config(format!("Listener not exist in store: {}", type_name::<T>()))
            })
    }

    pub fn add_first<L: ProxyListener>(&mut self, listener: L) -> &mut Self {
        self.entries.insert(0, Self::entry(listener));
        self
    }

    pub fn add_last<L: ProxyListener>(&mut self, listener: L) -> &mut Self {
        self.entries.push(Self::entry(listener));
        self
    }

    /// Insert right before the first listener of type `T`.
    pub fn add_before<T: ProxyListener, L: ProxyListener>(&mut self, listener: L) -> Result<&mut Self> {
        let index = self.position::<T>()?;
        self.entries.insert(index, Self::entry(listener));
        Ok(self)
    }

    /// Insert right after the first listener of type `T`.
    pub fn add_after<T: ProxyListener, L: ProxyListener>(&mut self, listener: L) -> Result<&mut Self> {
        let index = self.position::<T>()?;
        self.entries.insert(index + 1, Self::entry(listener));
        Ok(self)
    }

    /// Remove the first listener of type `T`.
    pub fn remove<T: ProxyListener>(&mut self) -> Result<&mut Self> {
        let index = self.position::<T>()?;
        self.entries.remove(index);
        Ok(self)
    }

    pub fn contains<T: ProxyListener>(&self) -> bool {
        self.position::<T>().is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn ProxyListener>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }
}

impl fmt::Debug for ListenerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct First;
    struct Second;
    struct Third;

    impl ProxyListener for First {}
    impl ProxyListener for Second {}
    impl ProxyListener for Third {}

    fn short_names(store: &ListenerStore) -> Vec<&'static str> {
        store
            .names()
            .into_iter()
            .map(|name| name.rsplit("::").next().unwrap_or(name))
            .collect()
    }

    #[test]
    fn test_add_first_and_last() {
        let mut store = ListenerStore::new();
        store.add_last(Second).add_first(First).add_last(Third);
        assert_eq!(short_names(&store), vec!["First", "Second", "Third"]);
    }

    #[test]
    fn test_add_before_and_after() {
        let mut store = ListenerStore::new();
        store.add_last(Second);
        store.add_before::<Second, _>(First).unwrap();
        store.add_after::<Second, _>(Third).unwrap();
        assert_eq!(short_names(&store), vec!["First", "Second", "Third"]);
    }

    #[test]
    fn test_missing_target_is_error() {
        let mut store = ListenerStore::new();
        store.add_last(First);
        let err = store.add_after::<Second, _>(Third).unwrap_err();
        assert!(err.to_string().contains("Listener not exist in store"));
        assert!(store.remove::<Third>().is_err());
    }

    #[test]
    fn test_remove() {
        let mut store = ListenerStore::new();
        store.add_last(First).add_last(Second);
        store.remove::<First>().unwrap();
        assert!(!store.contains::<First>());
        assert_eq!(store.len(), 1);
    }
}
