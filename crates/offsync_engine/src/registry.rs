//! Host-owned registry of storage connections.
//!
//! Engines look up their storage by connection tag. A tag that is not
//! connected yet parks callers until the host registers it.

use crate::error::StorageError;
use crate::storage::LocalStorage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// State of one connection tag.
pub enum ConnectionSlot {
    /// Storage is available.
    Connected(Arc<dyn LocalStorage>),
    /// Callers waiting for the storage to be registered.
    Waiting(Vec<oneshot::Sender<Arc<dyn LocalStorage>>>),
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionSlot::Connected(_) => f.write_str("Connected"),
            ConnectionSlot::Waiting(waiters) => {
                f.debug_tuple("Waiting").field(&waiters.len()).finish()
            }
        }
    }
}

/// Maps connection tags to storage adapters.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<String, ConnectionSlot>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a storage adapter under `tag`, waking every waiter.
    ///
    /// Returns the previously connected adapter, if any.
    pub fn register(
        &self,
        tag: impl Into<String>,
        storage: Arc<dyn LocalStorage>,
    ) -> Option<Arc<dyn LocalStorage>> {
        let tag = tag.into();
        let previous = self
            .slots
            .lock()
            .insert(tag.clone(), ConnectionSlot::Connected(Arc::clone(&storage)));

        match previous {
            Some(ConnectionSlot::Connected(old)) => Some(old),
            Some(ConnectionSlot::Waiting(waiters)) => {
                debug!(tag = %tag, waiters = waiters.len(), "storage connected");
                for waiter in waiters {
                    let _ = waiter.send(Arc::clone(&storage));
                }
                None
            }
            None => None,
        }
    }

    /// Disconnects a tag. Pending waiters fail with a closed connection.
    pub fn unregister(&self, tag: &str) -> Option<Arc<dyn LocalStorage>> {
        match self.slots.lock().remove(tag) {
            Some(ConnectionSlot::Connected(storage)) => Some(storage),
            Some(ConnectionSlot::Waiting(_)) | None => None,
        }
    }

    /// Returns the storage of a tag if it is connected.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn LocalStorage>> {
        match self.slots.lock().get(tag) {
            Some(ConnectionSlot::Connected(storage)) => Some(Arc::clone(storage)),
            Some(ConnectionSlot::Waiting(_)) | None => None,
        }
    }

    /// Returns true if the tag is connected.
    pub fn is_connected(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    /// Returns the number of callers still parked on a tag.
    pub fn waiting(&self, tag: &str) -> usize {
        match self.slots.lock().get(tag) {
            Some(ConnectionSlot::Waiting(waiters)) => {
                waiters.iter().filter(|tx| !tx.is_closed()).count()
            }
            Some(ConnectionSlot::Connected(_)) | None => 0,
        }
    }

    /// Waits until a storage adapter is registered under `tag`.
    ///
    /// Waiters whose caller went away are dropped before a new one is parked.
    pub async fn acquire(&self, tag: &str) -> Result<Arc<dyn LocalStorage>, StorageError> {
        let rx = {
            let mut slots = self.slots.lock();
            match slots.get_mut(tag) {
                Some(ConnectionSlot::Connected(storage)) => return Ok(Arc::clone(storage)),
                Some(ConnectionSlot::Waiting(waiters)) => {
                    waiters.retain(|tx| !tx.is_closed());
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.insert(tag.to_string(), ConnectionSlot::Waiting(vec![tx]));
                    rx
                }
            }
        };

        debug!(tag, "waiting for storage connection");
        rx.await
            .map_err(|_| StorageError::ConnectionClosed(tag.to_string()))
    }
}
