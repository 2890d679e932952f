//! In-memory transport backend.
//!
//! A [`LoopbackFabric`] connects two [`LoopbackTransport`]s through shared
//! queues, one inbound queue per side. There is no I/O task; the embedding
//! (usually a test) pumps delivery by draining its side's queue and feeding
//! each frame into its endpoint. That makes handshake and dispatch flows
//! fully deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use weft::connection::ConnectionHandle;
use weft::ids::{ConnectionId, IdGenerator};
use weft::key::TypeKey;
use weft::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::Left => "loopback:left",
            Side::Right => "loopback:right",
        }
    }
}

type InboundQueue = Mutex<VecDeque<(Arc<ConnectionHandle>, Bytes)>>;

struct FabricState {
    ids: IdGenerator,
    // Local connection id -> the handle the *other* side sees the stream as.
    peers: Mutex<HashMap<ConnectionId, (Side, Arc<ConnectionHandle>)>>,
    open: Mutex<HashSet<ConnectionId>>,
    inbound_left: InboundQueue,
    inbound_right: InboundQueue,
    default_left: Arc<ConnectionHandle>,
    default_right: Arc<ConnectionHandle>,
}

impl FabricState {
    fn inbound(&self, side: Side) -> &InboundQueue {
        match side {
            Side::Left => &self.inbound_left,
            Side::Right => &self.inbound_right,
        }
    }

    fn default_handle(&self, side: Side) -> &Arc<ConnectionHandle> {
        match side {
            Side::Left => &self.default_left,
            Side::Right => &self.default_right,
        }
    }

    fn link(&self, side: Side, local: &Arc<ConnectionHandle>, remote: &Arc<ConnectionHandle>) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.insert(local.id(), (side, Arc::clone(remote)));
        peers.insert(remote.id(), (side.opposite(), Arc::clone(local)));
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        open.insert(local.id());
        open.insert(remote.id());
    }
}

/// Builder for a connected pair of in-memory transports.
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Creates two transports wired back to back, each with its default
    /// connection already paired with the other side's.
    pub fn pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let ids = IdGenerator::default();
        let default_left = Arc::new(ConnectionHandle::new(
            ConnectionId::new(ids.next()),
            TypeKey::DEFAULT_CONNECTION,
            Side::Right.label(),
        ));
        let default_right = Arc::new(ConnectionHandle::new(
            ConnectionId::new(ids.next()),
            TypeKey::DEFAULT_CONNECTION,
            Side::Left.label(),
        ));
        let state = Arc::new(FabricState {
            ids,
            peers: Mutex::new(HashMap::new()),
            open: Mutex::new(HashSet::new()),
            inbound_left: Mutex::new(VecDeque::new()),
            inbound_right: Mutex::new(VecDeque::new()),
            default_left: Arc::clone(&default_left),
            default_right: Arc::clone(&default_right),
        });
        state.link(Side::Left, &default_left, &default_right);

        (
            Arc::new(LoopbackTransport {
                side: Side::Left,
                state: Arc::clone(&state),
            }),
            Arc::new(LoopbackTransport {
                side: Side::Right,
                state,
            }),
        )
    }
}

/// One side of a loopback pair.
pub struct LoopbackTransport {
    side: Side,
    state: Arc<FabricState>,
}

impl LoopbackTransport {
    /// Drains every frame queued for this side, oldest first. Each entry
    /// carries the local handle of the stream the bytes arrived on.
    pub fn drain_inbound(&self) -> Vec<(Arc<ConnectionHandle>, Bytes)> {
        let mut queue = self
            .state
            .inbound(self.side)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn has_inbound(&self) -> bool {
        !self
            .state
            .inbound(self.side)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl Transport for LoopbackTransport {
    fn write(&self, conn: &ConnectionHandle, bytes: Bytes) -> Result<(), TransportError> {
        let (owner, remote) = {
            let peers = self.state.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers
                .get(&conn.id())
                .cloned()
                .ok_or(TransportError::NotOpen(conn.id()))?
        };
        if !self.is_open(conn) {
            return Err(TransportError::NotOpen(conn.id()));
        }
        let mut queue = self
            .state
            .inbound(owner.opposite())
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let len = bytes.len();
        queue.push_back((remote, bytes));
        trace!(target: "loopback", conn = %conn.id(), len, "frame queued for peer");
        Ok(())
    }

    fn open_connection(&self, key: TypeKey) -> Result<Arc<ConnectionHandle>, TransportError> {
        if key == TypeKey::DEFAULT_CONNECTION {
            return Ok(Arc::clone(self.state.default_handle(self.side)));
        }
        let local = Arc::new(ConnectionHandle::new(
            ConnectionId::new(self.state.ids.next()),
            key,
            self.side.opposite().label(),
        ));
        let remote = Arc::new(ConnectionHandle::new(
            ConnectionId::new(self.state.ids.next()),
            key,
            self.side.label(),
        ));
        self.state.link(self.side, &local, &remote);
        debug!(
            target: "loopback",
            %key,
            local = %local.id(),
            remote = %remote.id(),
            "stream pair opened"
        );
        Ok(local)
    }

    fn close(&self, conn: &ConnectionHandle) -> Result<(), TransportError> {
        let remote_id = {
            let peers = self.state.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.get(&conn.id()).map(|(_, remote)| remote.id())
        };
        let mut open = self.state.open.lock().unwrap_or_else(|e| e.into_inner());
        if !open.remove(&conn.id()) {
            return Err(TransportError::NotOpen(conn.id()));
        }
        if let Some(remote_id) = remote_id {
            open.remove(&remote_id);
        }
        debug!(target: "loopback", conn = %conn.id(), "stream closed");
        Ok(())
    }

    fn is_open(&self, conn: &ConnectionHandle) -> bool {
        self.state
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&conn.id())
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("side", &self.side)
            .finish()
    }
}
