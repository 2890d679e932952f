//! Peer-to-peer messaging middleware.
//!
//! Two endpoints exchange typed messages over one or more physical
//! connections multiplexed under a single logical session. The crate has two
//! load-bearing pieces:
//!
//! - the **dispatch pipeline**: a per-type, ordered, predicate-guarded
//!   handler chain behind a [`router::MessageRouter`], run off the I/O
//!   thread with per-type mutual exclusion, and
//! - the **establishment handshake**: a four-message exchange through which
//!   either side can open a fresh physical connection bound to the same peer
//!   identity, while the requester blocks on an
//!   [`handshake::EstablishmentHandle`] until the new stream is primed.
//!
//! Transports, codecs and worker pools are collaborators behind small
//! traits; the `loopback` backend crate provides the in-memory transport
//! used by the integration tests.

pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod handler;
pub mod handshake;
pub mod ids;
pub mod key;
pub mod pipeline;
pub mod router;
pub mod runtime;
pub mod session;
pub mod transport;

pub mod prelude {
    pub use crate::codec::{BincodeSerializer, MessageSerializer, PayloadCodec, WireFrame};
    pub use crate::config::{EndpointConfig, HandshakeConfig};
    pub use crate::connection::{ConnectionHandle, ConnectionTable};
    pub use crate::endpoint::{Endpoint, EndpointError};
    pub use crate::handler::{DynPayload, FnHandler, Handler, HandlerTag};
    pub use crate::handshake::{EstablishmentHandle, HandshakeCoordinator, HandshakeError};
    pub use crate::ids::{ConnectionId, PeerId, SessionId};
    pub use crate::key::{TypeKey, TypedMessage};
    pub use crate::pipeline::{Condition, DispatchPipeline, PipelineError};
    pub use crate::router::{DispatchOutcome, MessageRouter, RouterError};
    pub use crate::runtime::{CallerThreadPool, TokioWorkerPool, WorkerPool};
    pub use crate::session::Session;
    pub use crate::transport::{Transport, TransportError};
}
