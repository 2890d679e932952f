//! Per-peer session context.
//!
//! A [`Session`] groups everything the middleware tracks about one logical
//! peer: its identity and the table of physical connections multiplexed
//! under it. Handlers receive the session unchanged; the dispatch core does
//! not interpret any application state callers attach around it.

use std::fmt;
use std::sync::RwLock;

use thiserror::Error;

use crate::connection::ConnectionTable;
use crate::ids::{PeerId, SessionId};

/// Errors for identity assignment.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("peer identity already assigned ({current}); use force_identity to override")]
    AlreadyAssigned { current: PeerId },
    #[error("refusing to assign the empty identity sentinel")]
    EmptyIdentity,
}

/// Context for one logical peer across all of its physical connections.
pub struct Session {
    id: SessionId,
    identity: RwLock<PeerId>,
    connections: ConnectionTable,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            identity: RwLock::new(PeerId::EMPTY),
            connections: ConnectionTable::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer identity, [`PeerId::EMPTY`] while unassigned.
    pub fn identity(&self) -> PeerId {
        *self.identity.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_identity(&self) -> bool {
        !self.identity().is_empty()
    }

    /// Assigns the identity exactly once.
    ///
    /// Assigning over an existing identity fails; the handshake adoption
    /// logic relies on this to never let a remote identity overwrite a local
    /// one that was already set.
    pub fn assign_identity(&self, identity: PeerId) -> Result<(), IdentityError> {
        if identity.is_empty() {
            return Err(IdentityError::EmptyIdentity);
        }
        let mut slot = self.identity.write().unwrap_or_else(|e| e.into_inner());
        if !slot.is_empty() {
            return Err(IdentityError::AlreadyAssigned { current: *slot });
        }
        *slot = identity;
        Ok(())
    }

    /// Administrative override; replaces the identity unconditionally and
    /// returns the previous value.
    pub fn force_identity(&self, identity: PeerId) -> PeerId {
        let mut slot = self.identity.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, identity)
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity())
            .field("connections", &self.connections)
            .finish()
    }
}
