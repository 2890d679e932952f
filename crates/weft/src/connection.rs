//! Physical connection handles and the per-session connection table.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::ids::ConnectionId;
use crate::key::TypeKey;

/// One physical, ordered, bidirectional byte stream.
///
/// A handle is tagged with the [`TypeKey`] it was opened for and carries a
/// "primed" flag that flips to true once its establishment handshake has
/// completed. Until then the connection only carries control messages.
pub struct ConnectionHandle {
    id: ConnectionId,
    key: TypeKey,
    remote: String,
    primed: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, key: TypeKey, remote: impl Into<String>) -> Self {
        Self {
            id,
            key,
            remote: remote.into(),
            primed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The key this connection was opened for.
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// True once the establishment handshake for this connection completed.
    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    pub fn mark_primed(&self) {
        self.primed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("remote", &self.remote)
            .field("primed", &self.is_primed())
            .finish()
    }
}

/// Errors for connection-table mutations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection key {0} is already bound")]
    KeyTaken(TypeKey),
    #[error("no connection bound for key {0}")]
    UnknownKey(TypeKey),
}

/// Map from [`TypeKey`] to the physical connection carrying that key's
/// traffic.
///
/// Each key maps to at most one connection; a single connection may be
/// reachable under several keys through [`ConnectionTable::alias`]. The table
/// is mutated from handshake handlers running on worker threads, so all
/// access goes through an internal lock.
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<HashMap<TypeKey, Arc<ConnectionHandle>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `conn`. Fails if the key is already bound.
    pub fn insert(
        &self,
        key: TypeKey,
        conn: Arc<ConnectionHandle>,
    ) -> Result<(), ConnectionError> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&key) {
            return Err(ConnectionError::KeyTaken(key));
        }
        map.insert(key, conn);
        Ok(())
    }

    /// Makes the connection bound to `existing` reachable under `key` too.
    pub fn alias(&self, key: TypeKey, existing: TypeKey) -> Result<(), ConnectionError> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let conn = map
            .get(&existing)
            .cloned()
            .ok_or(ConnectionError::UnknownKey(existing))?;
        if map.contains_key(&key) {
            return Err(ConnectionError::KeyTaken(key));
        }
        map.insert(key, conn);
        Ok(())
    }

    pub fn get(&self, key: TypeKey) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    pub fn contains(&self, key: TypeKey) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }

    /// The default connection the session was created with, if any.
    pub fn default_connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.get(TypeKey::DEFAULT_CONNECTION)
    }

    pub fn remove(&self, key: TypeKey) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ConnectionTable")
            .field("bound_keys", &map.len())
            .finish()
    }
}
