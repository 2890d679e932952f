//! Transport seam.
//!
//! The middleware never owns sockets. A backend implements [`Transport`] and
//! feeds received frames back through the endpoint; everything above this
//! trait is transport-agnostic.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::connection::ConnectionHandle;
use crate::key::TypeKey;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection {0} is not open")]
    NotOpen(crate::ids::ConnectionId),
    #[error("transport refused to open a connection for {0}")]
    OpenRefused(TypeKey),
    #[error("transport shut down")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A byte-stream backend: ordered, reliable, bidirectional per connection.
pub trait Transport: Send + Sync {
    /// Queues `bytes` for delivery on `conn`. Ordering per connection is the
    /// backend's contract; completion of this call does not mean receipt.
    fn write(&self, conn: &ConnectionHandle, bytes: Bytes) -> Result<(), TransportError>;

    /// Opens a new physical connection intended to carry `key` traffic.
    fn open_connection(&self, key: TypeKey) -> Result<Arc<ConnectionHandle>, TransportError>;

    fn close(&self, conn: &ConnectionHandle) -> Result<(), TransportError>;

    fn is_open(&self, conn: &ConnectionHandle) -> bool;
}
