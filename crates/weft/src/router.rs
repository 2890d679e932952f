//! Type-keyed message routing.
//!
//! The router owns one [`DispatchPipeline`] per registered [`TypeKey`] plus
//! an ordered list of default handlers that catch traffic for unrouted keys.
//! Dispatch itself is cheap and synchronous; chain execution is pushed onto
//! the worker pool so the transport's reader context never blocks on
//! handlers.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::connection::ConnectionHandle;
use crate::handler::{DynPayload, Handler};
use crate::key::{TypeKey, TypedMessage};
use crate::pipeline::DispatchPipeline;
use crate::runtime::WorkerPool;
use crate::session::Session;

/// Programming-error-class dispatch failures. Raised synchronously, before
/// any work is scheduled on the pool.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The payload's runtime type does not match the type registered for the
    /// key it was dispatched under.
    #[error("payload runtime type does not match the type registered for {key}")]
    PayloadTypeMismatch { key: TypeKey },
    /// A second message type tried to claim an already-bound key.
    #[error("{key} is already bound to a different message type")]
    KeyConflict { key: TypeKey },
}

/// How a dispatched message was routed. "No route" is an expected outcome
/// the transport layer decides how to handle, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered pipeline took the message.
    Pipeline,
    /// No pipeline; the message went to this many default handlers.
    Fallback(usize),
    /// Neither a pipeline nor default handlers exist for the key.
    NoRoute,
}

/// Registry mapping [`TypeKey`] to its handler pipeline.
pub struct MessageRouter {
    pipelines: RwLock<HashMap<TypeKey, Arc<DispatchPipeline>>>,
    // TypeKey -> TypeId, established once at registration so per-message
    // validation is a single map probe instead of reflective key derivation.
    bindings: RwLock<HashMap<TypeKey, TypeId>>,
    default_handlers: RwLock<Vec<Arc<dyn Handler>>>,
    pool: Arc<dyn WorkerPool>,
}

impl MessageRouter {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            default_handlers: RwLock::new(Vec::new()),
            pool,
        }
    }

    /// Returns the pipeline registered for `T`, creating it if absent.
    ///
    /// The first registration binds `T::KEY` to `T`; a different message
    /// type claiming the same key is rejected.
    pub fn register<T: TypedMessage>(&self) -> Result<Arc<DispatchPipeline>, RouterError> {
        let key = T::KEY;
        {
            let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
            match bindings.get(&key) {
                Some(bound) if *bound != TypeId::of::<T>() => {
                    return Err(RouterError::KeyConflict { key });
                }
                Some(_) => {}
                None => {
                    bindings.insert(key, TypeId::of::<T>());
                }
            }
        }
        let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(pipelines.entry(key).or_insert_with(|| {
            debug!(target: "weft::router", %key, "pipeline created");
            Arc::new(DispatchPipeline::new(key))
        })))
    }

    /// Removes the pipeline (and key binding) for `T`. No-op if absent.
    pub fn unregister<T: TypedMessage>(&self) {
        self.unregister_key(T::KEY);
    }

    /// Removes the pipeline (and key binding) for `key`. No-op if absent.
    pub fn unregister_key(&self, key: TypeKey) {
        let removed = {
            let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
            pipelines.remove(&key)
        };
        self.bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if removed.is_none() {
            debug!(target: "weft::router", %key, "unregister for unknown key ignored");
        }
    }

    pub fn is_registered(&self, key: TypeKey) -> bool {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }

    /// Appends a handler to the fallback list consulted when no pipeline is
    /// registered for a dispatched key.
    pub fn add_default_handler(&self, handler: Arc<dyn Handler>) {
        handler.on_registered();
        self.default_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Routes one decoded payload.
    ///
    /// Validation (key/type binding) happens here, synchronously. The
    /// pipeline or fallback execution is submitted to the worker pool; the
    /// returned outcome only says where the message went.
    pub fn dispatch(
        &self,
        key: TypeKey,
        conn: &Arc<ConnectionHandle>,
        session: &Arc<Session>,
        payload: DynPayload,
    ) -> Result<DispatchOutcome, RouterError> {
        {
            let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bound) = bindings.get(&key) {
                if (*payload).type_id() != *bound {
                    return Err(RouterError::PayloadTypeMismatch { key });
                }
            }
        }

        let pipeline = {
            let pipelines = self.pipelines.read().unwrap_or_else(|e| e.into_inner());
            pipelines.get(&key).cloned()
        };
        if let Some(pipeline) = pipeline {
            let conn = Arc::clone(conn);
            let session = Arc::clone(session);
            self.pool.submit(Box::new(move || {
                if let Err(access) = pipeline.run(&conn, &session, &payload) {
                    warn!(
                        target: "weft::router",
                        %key,
                        %access,
                        "message dropped by inert pipeline"
                    );
                }
            }));
            return Ok(DispatchOutcome::Pipeline);
        }

        let fallbacks: Vec<Arc<dyn Handler>> = {
            let defaults = self
                .default_handlers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            defaults.clone()
        };
        if !fallbacks.is_empty() {
            let count = fallbacks.len();
            let conn = Arc::clone(conn);
            let session = Arc::clone(session);
            self.pool.submit(Box::new(move || {
                for handler in &fallbacks {
                    run_isolated(handler, &conn, &session, &payload, key);
                }
            }));
            return Ok(DispatchOutcome::Fallback(count));
        }

        debug!(target: "weft::router", %key, "no route for dispatched key");
        Ok(DispatchOutcome::NoRoute)
    }

    /// Drops every pipeline, key binding and default handler.
    pub fn clear(&self) {
        let pipelines = {
            let mut map = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };
        self.bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let defaults = {
            let mut list = self
                .default_handlers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *list)
        };
        for handler in &defaults {
            handler.on_unregistered();
        }
        debug!(
            target: "weft::router",
            pipelines = pipelines.len(),
            defaults = defaults.len(),
            "router cleared"
        );
    }

    /// Removes every registered pipeline that is empty and not sealed.
    ///
    /// Sealed pipelines are deliberately kept: sealing is the signal that a
    /// key is retired for good and must not be silently re-creatable by a
    /// later registration racing the sweep. Returns the number of removed
    /// pipelines.
    pub fn sweep_empty_pipelines(&self) -> usize {
        let mut swept = Vec::new();
        {
            let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
            pipelines.retain(|key, pipeline| {
                let keep = pipeline.is_sealed() || !pipeline.is_empty();
                if !keep {
                    swept.push(*key);
                }
                keep
            });
        }
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        for key in &swept {
            bindings.remove(key);
        }
        if !swept.is_empty() {
            debug!(target: "weft::router", count = swept.len(), "swept empty pipelines");
        }
        swept.len()
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field(
                "pipelines",
                &self.pipelines.read().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .field(
                "default_handlers",
                &self
                    .default_handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .len(),
            )
            .finish()
    }
}

fn run_isolated(
    handler: &Arc<dyn Handler>,
    conn: &Arc<ConnectionHandle>,
    session: &Arc<Session>,
    payload: &DynPayload,
    key: TypeKey,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        handler.invoke(conn, session, payload.as_ref())
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(fault)) => {
            warn!(
                target: "weft::router",
                %key,
                handler = %handler.tag(),
                %fault,
                "default handler fault isolated"
            );
        }
        Err(_) => {
            error!(
                target: "weft::router",
                %key,
                handler = %handler.tag(),
                "default handler panicked"
            );
        }
    }
}
