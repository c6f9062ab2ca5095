//! In-flight request table shared by the host link and the bridge hub.
//!
//! Every registered entry leaves the table exactly once: either a matching
//! reply resolves it, the waiter times out and cancels it, or the owner drops
//! every entry when its transport dies.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

/// Why a pending request ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingError {
    TimedOut,
    /// The table was cleared (transport lost) before a reply arrived.
    Abandoned,
}

pub struct PendingCalls<K, T> {
    inner: Mutex<HashMap<K, oneshot::Sender<T>>>,
}

impl<K, T> Default for PendingCalls<K, T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> PendingCalls<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, key: K) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(key, tx);
        rx
    }

    /// Deliver a reply. Returns false when nothing was waiting for `key`
    /// (late or unknown reply).
    pub async fn resolve(&self, key: &K, value: T) -> bool {
        match self.inner.lock().await.remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub async fn cancel(&self, key: &K) -> bool {
        self.inner.lock().await.remove(key).is_some()
    }

    /// Drop every waiter; their receivers observe [`PendingError::Abandoned`].
    pub async fn clear(&self) -> usize {
        let mut map = self.inner.lock().await;
        let n = map.len();
        map.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Wait for the reply to `key`, removing the entry if the deadline passes.
    pub async fn wait(
        &self,
        key: K,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, PendingError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PendingError::Abandoned),
            Err(_) => {
                self.cancel(&key).await;
                Err(PendingError::TimedOut)
            }
        }
    }
}
