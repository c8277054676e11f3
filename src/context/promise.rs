//! Write-once values shared between the two sides of a connection

use crate::error::{ProxyError, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum Settled<T> {
    Value(T),
    Failed(String),
}

/// A value that is settled exactly once and may be awaited by any number
/// of readers. Reading before settlement is an error, not a wait, unless
/// the caller explicitly uses [`Promise::wait`].
#[derive(Clone)]
pub struct Promise<T> {
    name: &'static str,
    tx: Arc<watch::Sender<Option<Settled<T>>>>,
}

impl<T: Clone> Promise<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    /// Settle with a value. Fails if already settled.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Settled::Value(value))
    }

    /// Settle as failed. Waiters receive [`ProxyError::Abandoned`].
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.settle(Settled::Failed(reason.into()))
    }

    fn settle(&self, settled: Settled<T>) -> Result<()> {
        let mut pending = Some(settled);
        let modified = self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = pending.take();
                true
            } else {
                false
            }
        });

        if modified {
            Ok(())
        } else {
            Err(ProxyError::AlreadyResolved(self.name))
        }
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.tx.borrow(), Some(Settled::Value(_)))
    }

    /// Value if settled; [`ProxyError::NotResolved`] otherwise.
    pub fn get(&self) -> Result<T> {
        match &*self.tx.borrow() {
            Some(settled) => self.unwrap_settled(settled),
            None => Err(ProxyError::NotResolved(self.name)),
        }
    }

    /// Wait until settled.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.tx.subscribe();
        let settled = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| ProxyError::Abandoned(self.name, "dropped".to_string()))?;

        match &*settled {
            Some(settled) => self.unwrap_settled(settled),
            None => Err(ProxyError::NotResolved(self.name)),
        }
    }

    fn unwrap_settled(&self, settled: &Settled<T>) -> Result<T> {
        match settled {
            Settled::Value(value) => Ok(value.clone()),
            Settled::Failed(reason) => Err(ProxyError::Abandoned(self.name, reason.clone())),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.tx.borrow() {
            None => "pending",
            Some(Settled::Value(_)) => "resolved",
            Some(Settled::Failed(_)) => "failed",
        };
        f.debug_struct("Promise")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}
