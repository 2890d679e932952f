//! Composition root for one logical peer.
//!
//! An [`Endpoint`] wires the router, the handshake coordinator, the codec
//! and a transport together, with nothing global: embeddings own as many
//! endpoints as they like and every collaborator is reachable only through
//! its endpoint.
//!
//! The transport backend feeds received bytes into
//! [`Endpoint::handle_inbound`]; outbound typed messages leave through
//! [`Endpoint::send`], over the connection bound to the message's key or the
//! default connection as fallback.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{BincodeSerializer, CodecError, MessageSerializer, PayloadCodec};
use crate::config::EndpointConfig;
use crate::connection::ConnectionHandle;
use crate::handler::FnHandler;
use crate::handshake::{
    ConnectionInitializer, ConnectionRequest, ConnectionResponse, EstablishmentHandle,
    HandshakeCoordinator, HandshakeError, IdentityPing,
};
use crate::ids::SessionId;
use crate::key::{TypeKey, TypedMessage};
use crate::pipeline::DispatchPipeline;
use crate::router::{DispatchOutcome, MessageRouter, RouterError};
use crate::runtime::{RuntimeError, TokioWorkerPool, WorkerPool};
use crate::session::Session;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("no connection bound for {0} and no default connection")]
    NoConnection(TypeKey),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One endpoint of a logical peer-to-peer link.
pub struct Endpoint {
    config: EndpointConfig,
    session: Arc<Session>,
    router: Arc<MessageRouter>,
    coordinator: Arc<HandshakeCoordinator>,
    codec: Arc<PayloadCodec>,
    serializer: Arc<dyn MessageSerializer>,
    transport: Arc<dyn Transport>,
}

impl Endpoint {
    /// Builds an endpoint over `transport` and opens its default connection.
    ///
    /// The four control pipelines are registered here; their keys sit in the
    /// reserved control range, so application types can never shadow them.
    pub fn new(
        config: EndpointConfig,
        session_id: SessionId,
        transport: Arc<dyn Transport>,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self, EndpointError> {
        let serializer: Arc<dyn MessageSerializer> = Arc::new(BincodeSerializer);
        let codec = Arc::new(PayloadCodec::new());
        let router = Arc::new(MessageRouter::new(pool));
        let coordinator = Arc::new(HandshakeCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&serializer),
            Arc::clone(&codec),
        ));

        let session = Arc::new(Session::new(session_id));
        let default = transport.open_connection(TypeKey::DEFAULT_CONNECTION)?;
        session
            .connections()
            .insert(TypeKey::DEFAULT_CONNECTION, default)
            .map_err(HandshakeError::from)?;

        let endpoint = Self {
            config,
            session,
            router,
            coordinator,
            codec,
            serializer,
            transport,
        };
        endpoint.register_control_routes()?;
        Ok(endpoint)
    }

    /// Like [`new`](Self::new), with a tokio worker pool sized from
    /// `config.worker_threads`.
    pub fn with_tokio_pool(
        config: EndpointConfig,
        session_id: SessionId,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EndpointError> {
        let pool = TokioWorkerPool::multi_thread(config.worker_threads)?;
        Self::new(config, session_id, transport, Arc::new(pool))
    }

    fn register_control_routes(&self) -> Result<(), EndpointError> {
        self.codec.register::<ConnectionRequest>();
        self.codec.register::<ConnectionInitializer>();
        self.codec.register::<ConnectionResponse>();
        self.codec.register::<IdentityPing>();

        let coordinator = Arc::clone(&self.coordinator);
        self.control_pipeline::<ConnectionRequest>(FnHandler::try_full(
            "weft.handshake.request",
            move |_conn: &Arc<ConnectionHandle>, session: &Session, msg: &ConnectionRequest| {
                coordinator.on_connection_request(session, msg.key)?;
                Ok(())
            },
        ))?;

        let coordinator = Arc::clone(&self.coordinator);
        self.control_pipeline::<ConnectionInitializer>(FnHandler::try_full(
            "weft.handshake.initializer",
            move |conn: &Arc<ConnectionHandle>,
                  session: &Session,
                  msg: &ConnectionInitializer| {
                coordinator.on_connection_initializer(session, conn, msg.key)?;
                Ok(())
            },
        ))?;

        let coordinator = Arc::clone(&self.coordinator);
        self.control_pipeline::<ConnectionResponse>(FnHandler::try_full(
            "weft.handshake.response",
            move |conn: &Arc<ConnectionHandle>,
                  session: &Session,
                  msg: &ConnectionResponse| {
                coordinator.on_connection_response(session, conn, msg.identity)?;
                Ok(())
            },
        ))?;

        let coordinator = Arc::clone(&self.coordinator);
        self.control_pipeline::<IdentityPing>(FnHandler::try_full(
            "weft.handshake.ping",
            move |conn: &Arc<ConnectionHandle>, session: &Session, msg: &IdentityPing| {
                coordinator.on_identity_ping(session, conn, msg.identity)?;
                Ok(())
            },
        ))?;
        Ok(())
    }

    fn control_pipeline<T: TypedMessage>(
        &self,
        handler: Arc<dyn crate::handler::Handler>,
    ) -> Result<(), EndpointError> {
        let pipeline = self.router.register::<T>()?;
        pipeline.add_last(handler)?;
        Ok(())
    }

    /// Registers a message type end to end: a payload decoder for inbound
    /// frames and a dispatch pipeline for `T::KEY`.
    pub fn register_message<T>(&self) -> Result<Arc<DispatchPipeline>, RouterError>
    where
        T: TypedMessage + DeserializeOwned,
    {
        self.codec.register::<T>();
        self.router.register::<T>()
    }

    /// Feeds one received frame into the dispatch path.
    ///
    /// Codec faults come back as `Err`; the reader loop is expected to log
    /// and continue, not to tear down the connection.
    pub fn handle_inbound(
        &self,
        conn: &Arc<ConnectionHandle>,
        bytes: &[u8],
    ) -> Result<DispatchOutcome, EndpointError> {
        if bytes.len() > self.config.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: bytes.len(),
                max: self.config.max_frame_bytes,
            }
            .into());
        }
        let frame = self.serializer.decode_frame(bytes)?;
        let payload = self.codec.decode(&frame)?;
        let outcome = self
            .router
            .dispatch(frame.key, conn, &self.session, payload)?;
        if outcome == DispatchOutcome::NoRoute {
            warn!(target: "weft::endpoint", key = %frame.key, "inbound frame had no route");
        }
        Ok(outcome)
    }

    /// Sends a typed message over the connection bound to `T::KEY`, falling
    /// back to the default connection when the key has no stream of its own.
    pub fn send<T>(&self, value: &T) -> Result<(), EndpointError>
    where
        T: TypedMessage + Serialize,
    {
        let conn = self
            .session
            .connections()
            .get(T::KEY)
            .or_else(|| self.session.connections().default_connection())
            .ok_or(EndpointError::NoConnection(T::KEY))?;
        let frame = self.codec.encode(value)?;
        let bytes = self.serializer.encode_frame(&frame)?;
        self.transport.write(&conn, bytes::Bytes::from(bytes))?;
        debug!(target: "weft::endpoint", key = %T::KEY, conn = %conn.id(), "frame sent");
        Ok(())
    }

    /// Starts the establishment handshake for `key` and returns the handle
    /// the caller can block on.
    pub fn establish(&self, key: TypeKey) -> Result<EstablishmentHandle, EndpointError> {
        Ok(self.coordinator.create_new_connection(&self.session, key)?)
    }

    /// Blocks on `handle` for the configured establishment timeout.
    /// `Ok(false)` means the handshake was still pending when time ran out.
    pub fn wait_established(&self, handle: &EstablishmentHandle) -> Result<bool, EndpointError> {
        Ok(handle.wait_timeout(self.config.handshake.establish_timeout)?)
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<HandshakeCoordinator> {
        &self.coordinator
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("session", &self.session)
            .field("router", &self.router)
            .finish()
    }
}
