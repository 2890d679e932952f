//! Connection-establishment handshake.
//!
//! Either endpoint can request a brand-new physical connection for a
//! [`TypeKey`] while both sides keep talking over the default connection.
//! The exchange is four control messages, themselves routed through the
//! dispatch pipeline like any other traffic:
//!
//! ```text
//! initiator                         responder
//!   ConnectionRequest(K)     -->                 (default connection)
//!                            <--  ConnectionInitializer(K)   (new connection)
//!   ConnectionResponse(id?)  -->                 (new connection)
//!                            <--  IdentityPing(id)           (new connection)
//!   IdentityPing(id)         -->   echo, once    (new connection)
//! ```
//!
//! The initiator blocks on an [`EstablishmentHandle`] until the ping round
//! trip primes the connection. Handshake handlers run on worker threads, so
//! the coordinator itself never blocks; only the application thread that
//! asked for the connection does.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CodecError, MessageSerializer, PayloadCodec};
use crate::connection::{ConnectionError, ConnectionHandle};
use crate::ids::PeerId;
use crate::key::{TypeKey, TypedMessage};
use crate::session::Session;
use crate::transport::{Transport, TransportError};

/// Asks the peer to open a fresh connection for `key`. Travels over the
/// default connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub key: TypeKey,
}

/// First message on the newly opened connection; tells the initiator which
/// key the stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInitializer {
    pub key: TypeKey,
}

/// The initiator's identity, or `None` if it has none yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub identity: Option<PeerId>,
}

/// Final identity-binding round trip; echoed back exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPing {
    pub identity: PeerId,
}

impl TypedMessage for ConnectionRequest {
    const KEY: TypeKey = TypeKey::new(TypeKey::CONTROL_RANGE_START);
}

impl TypedMessage for ConnectionInitializer {
    const KEY: TypeKey = TypeKey::new(TypeKey::CONTROL_RANGE_START + 1);
}

impl TypedMessage for ConnectionResponse {
    const KEY: TypeKey = TypeKey::new(TypeKey::CONTROL_RANGE_START + 2);
}

impl TypedMessage for IdentityPing {
    const KEY: TypeKey = TypeKey::new(TypeKey::CONTROL_RANGE_START + 3);
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("{0} is reserved for control traffic")]
    ReservedKey(TypeKey),
    #[error("{0} already has an established connection; reuse it instead of re-handshaking")]
    KeyAlreadyBound(TypeKey),
    #[error("no pending handshake for {0}")]
    NoPendingHandshake(TypeKey),
    #[error("session has no default connection to carry the request")]
    NoDefaultConnection,
    #[error("pending handshake for {0} was cancelled")]
    Cancelled(TypeKey),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    Fulfilled,
    Cancelled,
}

struct WaitInner {
    key: TypeKey,
    state: Mutex<WaitState>,
    cond: Condvar,
}

/// Blocking wait handle for one pending handshake.
///
/// Cloneable; every clone observes the same fulfillment. Waiting suspends
/// the calling thread only, never a worker.
#[derive(Clone)]
pub struct EstablishmentHandle {
    inner: Arc<WaitInner>,
}

impl EstablishmentHandle {
    fn new(key: TypeKey) -> Self {
        Self {
            inner: Arc::new(WaitInner {
                key,
                state: Mutex::new(WaitState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks until the handshake completes or is cancelled.
    pub fn wait(&self) -> Result<(), HandshakeError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state == WaitState::Pending {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        match *state {
            WaitState::Fulfilled => Ok(()),
            _ => Err(HandshakeError::Cancelled(self.inner.key)),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. `Ok(false)`
    /// means the handshake is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, HandshakeError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while *state == WaitState::Pending {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _timed_out) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        match *state {
            WaitState::Fulfilled => Ok(true),
            _ => Err(HandshakeError::Cancelled(self.inner.key)),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) == WaitState::Fulfilled
    }

    fn settle(&self, state: WaitState) {
        let mut slot = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *slot == WaitState::Pending {
            *slot = state;
            self.inner.cond.notify_all();
        }
    }
}

impl std::fmt::Debug for EstablishmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishmentHandle")
            .field("key", &self.inner.key)
            .field(
                "state",
                &*self.inner.state.lock().unwrap_or_else(|e| e.into_inner()),
            )
            .finish()
    }
}

/// Where the protocol stands for one key, from this endpoint's point of
/// view. The `PingSent` side treats an incoming ping as the echo and must
/// not reply again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestSent,
    InitializerSent,
    ResponseSent,
    PingSent,
}

/// Drives the establishment protocol for one endpoint.
pub struct HandshakeCoordinator {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn MessageSerializer>,
    codec: Arc<PayloadCodec>,
    pending: Mutex<HashMap<TypeKey, EstablishmentHandle>>,
    stages: Mutex<HashMap<TypeKey, Stage>>,
}

impl HandshakeCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn MessageSerializer>,
        codec: Arc<PayloadCodec>,
    ) -> Self {
        Self {
            transport,
            serializer,
            codec,
            pending: Mutex::new(HashMap::new()),
            stages: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wait handle for `key`, creating it if absent.
    ///
    /// Idempotent join: repeated or concurrent calls for the same
    /// unestablished key get the same handle.
    pub fn prepare_connection(&self, key: TypeKey) -> Result<EstablishmentHandle, HandshakeError> {
        if key.is_control() {
            return Err(HandshakeError::ReservedKey(key));
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pending
            .entry(key)
            .or_insert_with(|| EstablishmentHandle::new(key))
            .clone())
    }

    /// Starts a handshake: registers the wait handle, then sends
    /// `ConnectionRequest(key)` over the session's default connection.
    ///
    /// The handle is registered before the request goes out so the remote's
    /// reply can never race past an unregistered waiter.
    pub fn create_new_connection(
        &self,
        session: &Session,
        key: TypeKey,
    ) -> Result<EstablishmentHandle, HandshakeError> {
        if key.is_control() {
            return Err(HandshakeError::ReservedKey(key));
        }
        if session.connections().contains(key) {
            return Err(HandshakeError::KeyAlreadyBound(key));
        }
        let default = session
            .connections()
            .default_connection()
            .ok_or(HandshakeError::NoDefaultConnection)?;

        let handle = self.prepare_connection(key)?;
        self.set_stage(key, Stage::RequestSent);
        if let Err(send) = self.send_control(&default, &ConnectionRequest { key }) {
            // Roll back so a retry starts clean. The evicted entry may carry
            // waiters from earlier prepare_connection calls; settle them so
            // nobody blocks on a request that was never sent.
            let evicted = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            self.clear_stage(key);
            if let Some(evicted) = evicted {
                evicted.settle(WaitState::Cancelled);
            }
            return Err(send);
        }
        debug!(target: "weft::handshake", %key, "connection request sent");
        Ok(handle)
    }

    /// Fulfills and removes the pending entry for `key`, releasing every
    /// thread waiting on its handle.
    pub fn connection_established(&self, key: TypeKey) -> Result<(), HandshakeError> {
        let handle = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .remove(&key)
                .ok_or(HandshakeError::NoPendingHandshake(key))?
        };
        handle.settle(WaitState::Fulfilled);
        debug!(target: "weft::handshake", %key, "handshake fulfilled");
        Ok(())
    }

    /// Evicts an abandoned pending handshake. Waiters observe
    /// [`HandshakeError::Cancelled`]. Returns false if nothing was pending.
    pub fn cancel_pending(&self, key: TypeKey) -> bool {
        let handle = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&key)
        };
        self.clear_stage(key);
        match handle {
            Some(handle) => {
                handle.settle(WaitState::Cancelled);
                warn!(target: "weft::handshake", %key, "pending handshake cancelled");
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self, key: TypeKey) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }

    /// Responder side: a peer asked for a new connection carrying `key`.
    /// Opens the stream and announces it with `ConnectionInitializer`.
    pub fn on_connection_request(
        &self,
        session: &Session,
        key: TypeKey,
    ) -> Result<(), HandshakeError> {
        if key.is_control() {
            return Err(HandshakeError::ReservedKey(key));
        }
        if session.connections().contains(key) {
            return Err(HandshakeError::KeyAlreadyBound(key));
        }
        let conn = self.transport.open_connection(key)?;
        session.connections().insert(key, Arc::clone(&conn))?;
        self.set_stage(key, Stage::InitializerSent);
        self.send_control(&conn, &ConnectionInitializer { key })?;
        debug!(target: "weft::handshake", %key, conn = %conn.id(), "initializer sent");
        Ok(())
    }

    /// Initiator side: the new stream announced itself. Bind it into the
    /// connection table and answer with our identity, if we have one.
    pub fn on_connection_initializer(
        &self,
        session: &Session,
        conn: &Arc<ConnectionHandle>,
        key: TypeKey,
    ) -> Result<(), HandshakeError> {
        session.connections().insert(key, Arc::clone(conn))?;
        let identity = session.identity();
        let response = ConnectionResponse {
            identity: (!identity.is_empty()).then_some(identity),
        };
        self.set_stage(key, Stage::ResponseSent);
        self.send_control(conn, &response)?;
        debug!(target: "weft::handshake", %key, "response sent");
        Ok(())
    }

    /// Responder side: the initiator told us its identity (or lack of one).
    /// Settle on an identity and start the ping round trip.
    pub fn on_connection_response(
        &self,
        session: &Session,
        conn: &Arc<ConnectionHandle>,
        identity: Option<PeerId>,
    ) -> Result<(), HandshakeError> {
        if !session.has_identity() {
            let adopted = identity.unwrap_or_else(PeerId::generate);
            if let Err(raced) = session.assign_identity(adopted) {
                // Another connection's handshake got there first; keep it.
                debug!(target: "weft::handshake", %raced, "identity already settled");
            }
        }
        let key = conn.key();
        self.set_stage(key, Stage::PingSent);
        self.send_control(
            conn,
            &IdentityPing {
                identity: session.identity(),
            },
        )?;
        debug!(target: "weft::handshake", %key, "identity ping sent");
        Ok(())
    }

    /// Either side: the ping that primes the connection.
    ///
    /// Adopts the carried identity if we have none, echoes the ping exactly
    /// once (the side that already pinged treats this as the echo), and
    /// releases any local waiter for the key.
    pub fn on_identity_ping(
        &self,
        session: &Session,
        conn: &Arc<ConnectionHandle>,
        identity: PeerId,
    ) -> Result<(), HandshakeError> {
        if !session.has_identity() && !identity.is_empty() {
            if let Err(raced) = session.assign_identity(identity) {
                debug!(target: "weft::handshake", %raced, "identity already settled");
            }
        }
        conn.mark_primed();

        let key = conn.key();
        let already_pinged = {
            let stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
            stages.get(&key) == Some(&Stage::PingSent)
        };
        if !already_pinged {
            self.send_control(
                conn,
                &IdentityPing {
                    identity: session.identity(),
                },
            )?;
            debug!(target: "weft::handshake", %key, "identity ping echoed");
        }
        self.clear_stage(key);

        let waiter = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&key)
        };
        if let Some(handle) = waiter {
            handle.settle(WaitState::Fulfilled);
        }
        debug!(target: "weft::handshake", %key, conn = %conn.id(), "connection primed");
        Ok(())
    }

    fn send_control<T>(&self, conn: &ConnectionHandle, message: &T) -> Result<(), HandshakeError>
    where
        T: TypedMessage + Serialize,
    {
        let frame = self.codec.encode(message)?;
        let bytes = self.serializer.encode_frame(&frame)?;
        self.transport.write(conn, bytes::Bytes::from(bytes))?;
        Ok(())
    }

    fn set_stage(&self, key: TypeKey, stage: Stage) {
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, stage);
    }

    fn clear_stage(&self, key: TypeKey) {
        self.stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

impl std::fmt::Debug for HandshakeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeCoordinator")
            .field(
                "pending",
                &self.pending.lock().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeSerializer;
    use crate::ids::{ConnectionId, IdGenerator, SessionId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    /// Transport double that records every outbound frame.
    struct RecordingTransport {
        ids: IdGenerator,
        writes: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
        open_count: AtomicUsize,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                ids: IdGenerator::default(),
                writes: Mutex::new(Vec::new()),
                open_count: AtomicUsize::new(0),
            }
        }

        fn written_frames(&self) -> Vec<WireFrameKeyed> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(conn, bytes)| {
                    let frame = BincodeSerializer.decode_frame(bytes).unwrap();
                    WireFrameKeyed {
                        conn: *conn,
                        key: frame.key,
                        payload: frame.payload,
                    }
                })
                .collect()
        }
    }

    struct WireFrameKeyed {
        conn: ConnectionId,
        key: TypeKey,
        payload: Vec<u8>,
    }

    impl Transport for RecordingTransport {
        fn write(
            &self,
            conn: &ConnectionHandle,
            bytes: bytes::Bytes,
        ) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push((conn.id(), bytes.to_vec()));
            Ok(())
        }

        fn open_connection(&self, key: TypeKey) -> Result<Arc<ConnectionHandle>, TransportError> {
            self.open_count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ConnectionHandle::new(
                ConnectionId::new(self.ids.next()),
                key,
                "mem",
            )))
        }

        fn close(&self, _conn: &ConnectionHandle) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self, _conn: &ConnectionHandle) -> bool {
            true
        }
    }

    /// Transport double whose writes always fail.
    struct RefusingTransport;

    impl Transport for RefusingTransport {
        fn write(
            &self,
            _conn: &ConnectionHandle,
            _bytes: bytes::Bytes,
        ) -> Result<(), TransportError> {
            Err(TransportError::Shutdown)
        }

        fn open_connection(&self, key: TypeKey) -> Result<Arc<ConnectionHandle>, TransportError> {
            Err(TransportError::OpenRefused(key))
        }

        fn close(&self, _conn: &ConnectionHandle) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self, _conn: &ConnectionHandle) -> bool {
            false
        }
    }

    fn coordinator() -> (Arc<RecordingTransport>, HandshakeCoordinator) {
        let transport = Arc::new(RecordingTransport::new());
        let coordinator = HandshakeCoordinator::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(BincodeSerializer),
            Arc::new(PayloadCodec::new()),
        );
        (transport, coordinator)
    }

    fn session_with_default() -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::new(1)));
        session
            .connections()
            .insert(
                TypeKey::DEFAULT_CONNECTION,
                Arc::new(ConnectionHandle::new(
                    ConnectionId::new(0),
                    TypeKey::DEFAULT_CONNECTION,
                    "mem",
                )),
            )
            .unwrap();
        session
    }

    const APP_KEY: TypeKey = TypeKey::new(11);

    #[test]
    fn prepare_is_an_idempotent_join() {
        let (_, coordinator) = coordinator();
        let a = coordinator.prepare_connection(APP_KEY).unwrap();
        let b = coordinator.prepare_connection(APP_KEY).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn one_fulfillment_releases_every_waiter() {
        let (_, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let handle = coordinator.prepare_connection(APP_KEY).unwrap();
            waiters.push(std::thread::spawn(move || handle.wait()));
        }
        // Give both threads time to park on the condvar.
        std::thread::sleep(Duration::from_millis(20));
        coordinator.connection_established(APP_KEY).unwrap();

        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
        assert!(!coordinator.has_pending(APP_KEY));
    }

    #[test]
    fn established_without_pending_is_a_caller_error() {
        let (_, coordinator) = coordinator();
        assert!(matches!(
            coordinator.connection_established(APP_KEY),
            Err(HandshakeError::NoPendingHandshake(key)) if key == APP_KEY
        ));
    }

    #[test]
    fn reserved_and_bound_keys_are_rejected_before_sending() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();

        let reserved = TypeKey::new(TypeKey::CONTROL_RANGE_START + 9);
        assert!(matches!(
            coordinator.create_new_connection(&session, reserved),
            Err(HandshakeError::ReservedKey(_))
        ));
        assert!(matches!(
            coordinator.create_new_connection(&session, TypeKey::DEFAULT_CONNECTION),
            Err(HandshakeError::KeyAlreadyBound(_))
        ));
        assert!(transport.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn create_without_default_connection_fails() {
        let (_, coordinator) = coordinator();
        let session = Session::new(SessionId::new(2));
        assert!(matches!(
            coordinator.create_new_connection(&session, APP_KEY),
            Err(HandshakeError::NoDefaultConnection)
        ));
    }

    #[test]
    fn create_sends_request_over_default_connection() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();

        let handle = coordinator.create_new_connection(&session, APP_KEY).unwrap();
        assert!(!handle.is_fulfilled());

        let frames = transport.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key, ConnectionRequest::KEY);
        assert_eq!(frames[0].conn, ConnectionId::new(0));
        let request: ConnectionRequest = BincodeSerializer::decode(&frames[0].payload).unwrap();
        assert_eq!(request.key, APP_KEY);
    }

    #[test]
    fn request_opens_connection_and_sends_initializer() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();

        coordinator.on_connection_request(&session, APP_KEY).unwrap();
        assert_eq!(transport.open_count.load(Ordering::SeqCst), 1);
        assert!(session.connections().contains(APP_KEY));

        let frames = transport.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key, ConnectionInitializer::KEY);
    }

    #[test]
    fn response_without_identity_makes_responder_generate_one() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();
        let conn = Arc::new(ConnectionHandle::new(ConnectionId::new(5), APP_KEY, "mem"));

        coordinator
            .on_connection_response(&session, &conn, None)
            .unwrap();
        assert!(session.has_identity());

        let frames = transport.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key, IdentityPing::KEY);
        let ping: IdentityPing = BincodeSerializer::decode(&frames[0].payload).unwrap();
        assert_eq!(ping.identity, session.identity());
    }

    #[test]
    fn ping_adopts_identity_primes_and_releases_waiter() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();
        let conn = Arc::new(ConnectionHandle::new(ConnectionId::new(5), APP_KEY, "mem"));
        let handle = coordinator.prepare_connection(APP_KEY).unwrap();

        let remote = PeerId::generate();
        coordinator
            .on_identity_ping(&session, &conn, remote)
            .unwrap();

        assert_eq!(session.identity(), remote, "unset identity is adopted");
        assert!(conn.is_primed());
        assert!(handle.is_fulfilled());

        // No prior ping from us, so this side echoes exactly once.
        let frames = transport.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key, IdentityPing::KEY);
    }

    #[test]
    fn ping_never_overwrites_an_assigned_identity() {
        let (_, coordinator) = coordinator();
        let session = session_with_default();
        let local = PeerId::generate();
        session.assign_identity(local).unwrap();
        let conn = Arc::new(ConnectionHandle::new(ConnectionId::new(5), APP_KEY, "mem"));

        coordinator
            .on_identity_ping(&session, &conn, PeerId::generate())
            .unwrap();
        assert_eq!(session.identity(), local);
    }

    #[test]
    fn the_pinging_side_does_not_echo_the_echo() {
        let (transport, coordinator) = coordinator();
        let session = session_with_default();
        let conn = Arc::new(ConnectionHandle::new(ConnectionId::new(5), APP_KEY, "mem"));

        // This side already sent the original ping via the response path.
        coordinator
            .on_connection_response(&session, &conn, None)
            .unwrap();
        let sent_before = transport.writes.lock().unwrap().len();

        coordinator
            .on_identity_ping(&session, &conn, session.identity())
            .unwrap();
        assert_eq!(
            transport.writes.lock().unwrap().len(),
            sent_before,
            "the echo must not be echoed back"
        );
        assert!(conn.is_primed());
    }

    #[test]
    fn cancellation_is_a_distinguishable_failure() {
        let (_, coordinator) = coordinator();
        let handle = coordinator.prepare_connection(APP_KEY).unwrap();
        let waiter = std::thread::spawn(move || handle.wait());
        std::thread::sleep(Duration::from_millis(20));

        assert!(coordinator.cancel_pending(APP_KEY));
        assert!(matches!(
            waiter.join().unwrap(),
            Err(HandshakeError::Cancelled(key)) if key == APP_KEY
        ));
        assert!(!coordinator.cancel_pending(APP_KEY), "nothing left to cancel");
    }

    #[test]
    fn failed_request_send_releases_earlier_waiters() {
        let coordinator = HandshakeCoordinator::new(
            Arc::new(RefusingTransport),
            Arc::new(BincodeSerializer),
            Arc::new(PayloadCodec::new()),
        );
        let session = session_with_default();
        let handle = coordinator.prepare_connection(APP_KEY).unwrap();

        let err = coordinator
            .create_new_connection(&session, APP_KEY)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Transport(_)));

        // The rollback must settle the evicted entry, not just drop it.
        assert!(!coordinator.has_pending(APP_KEY));
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(50)),
            Err(HandshakeError::Cancelled(key)) if key == APP_KEY
        ));
    }

    #[test]
    fn wait_timeout_reports_still_pending() {
        let (_, coordinator) = coordinator();
        let handle = coordinator.prepare_connection(APP_KEY).unwrap();
        assert!(!handle.wait_timeout(Duration::from_millis(10)).unwrap());

        coordinator.connection_established(APP_KEY).unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(10)).unwrap());
    }
}
