//! Ordered, predicate-guarded handler chain for one message type.
//!
//! A pipeline owns the handler entries registered for exactly one
//! [`TypeKey`] and runs them in queue order under a single run lock, so two
//! messages of the same type never interleave their chains. Entry faults are
//! isolated: a failing or panicking handler is reported and the chain moves
//! on to the next entry.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{error, warn};

use crate::connection::ConnectionHandle;
use crate::handler::{DynPayload, Handler, HandlerTag};
use crate::key::TypeKey;
use crate::session::Session;

/// Access faults raised by structural mutation or execution on an inert
/// pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline is closed; reopen it before mutating or running.
    #[error("pipeline for {0} is closed")]
    Closed(TypeKey),
    /// The pipeline is sealed; it can never be mutated, run or reopened.
    #[error("pipeline for {0} is sealed")]
    Sealed(TypeKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Open,
    Closed,
    Sealed,
}

/// Predicate over the full dispatch context. All predicates of an entry must
/// pass, in insertion order, before its handler fires.
pub type Predicate = Box<dyn Fn(&ConnectionHandle, &Session, &dyn Any) -> bool + Send + Sync>;

struct HandlerEntry {
    handler: Arc<dyn Handler>,
    predicates: Arc<Mutex<Vec<Predicate>>>,
}

impl HandlerEntry {
    fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            predicates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> (Arc<dyn Handler>, Arc<Mutex<Vec<Predicate>>>) {
        (Arc::clone(&self.handler), Arc::clone(&self.predicates))
    }
}

/// Attachment point for predicates on one registered entry.
///
/// Returned by the `add_*` operations; predicates attached later join the
/// entry's FIFO predicate queue. A condition whose entry was removed in the
/// meantime becomes inert.
#[derive(Debug)]
pub struct Condition {
    predicates: Weak<Mutex<Vec<Predicate>>>,
}

impl Condition {
    fn for_entry(entry: &HandlerEntry) -> Self {
        Self {
            predicates: Arc::downgrade(&entry.predicates),
        }
    }

    /// Attaches a predicate over the full (connection, session, payload)
    /// context.
    pub fn require<F>(&self, pred: F) -> &Self
    where
        F: Fn(&ConnectionHandle, &Session, &dyn Any) -> bool + Send + Sync + 'static,
    {
        if let Some(preds) = self.predicates.upgrade() {
            preds
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Box::new(pred));
        }
        self
    }

    /// Attaches a predicate over (session, payload) only.
    pub fn require_on_session<F>(&self, pred: F) -> &Self
    where
        F: Fn(&Session, &dyn Any) -> bool + Send + Sync + 'static,
    {
        self.require(move |_conn, session, payload| pred(session, payload))
    }
}

/// Where a new entry lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertAt {
    Front,
    Back,
}

/// Ordered handler chain for one [`TypeKey`].
pub struct DispatchPipeline {
    key: TypeKey,
    state: Mutex<PipelineState>,
    entries: Mutex<VecDeque<HandlerEntry>>,
    // Held for the whole duration of one run(); gives per-type mutual
    // exclusion without a router-global lock.
    run_lock: Mutex<()>,
}

impl DispatchPipeline {
    pub fn new(key: TypeKey) -> Self {
        Self {
            key,
            state: Mutex::new(PipelineState::Open),
            entries: Mutex::new(VecDeque::new()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_mutable(&self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Open => Ok(()),
            PipelineState::Closed => Err(PipelineError::Closed(self.key)),
            PipelineState::Sealed => Err(PipelineError::Sealed(self.key)),
        }
    }

    /// Inserts `handler` at the front of the queue.
    pub fn add_first(&self, handler: Arc<dyn Handler>) -> Result<Condition, PipelineError> {
        self.insert(handler, InsertAt::Front)
    }

    /// Appends `handler` at the back of the queue.
    pub fn add_last(&self, handler: Arc<dyn Handler>) -> Result<Condition, PipelineError> {
        self.insert(handler, InsertAt::Back)
    }

    /// Front insertion, skipped when an equal handler is already present.
    /// Returns `Ok(None)` on the skip; the rejected handler is notified via
    /// [`Handler::on_registration_rejected`].
    pub fn add_first_if_absent(
        &self,
        handler: Arc<dyn Handler>,
    ) -> Result<Option<Condition>, PipelineError> {
        self.insert_if_absent(handler, InsertAt::Front)
    }

    /// Back insertion, skipped when an equal handler is already present.
    pub fn add_last_if_absent(
        &self,
        handler: Arc<dyn Handler>,
    ) -> Result<Option<Condition>, PipelineError> {
        self.insert_if_absent(handler, InsertAt::Back)
    }

    fn insert(
        &self,
        handler: Arc<dyn Handler>,
        at: InsertAt,
    ) -> Result<Condition, PipelineError> {
        self.check_mutable()?;
        let entry = HandlerEntry::new(Arc::clone(&handler));
        let condition = Condition::for_entry(&entry);
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match at {
                InsertAt::Front => entries.push_front(entry),
                InsertAt::Back => entries.push_back(entry),
            }
        }
        // Callback outside the entry lock; handlers may touch the pipeline.
        handler.on_registered();
        Ok(condition)
    }

    fn insert_if_absent(
        &self,
        handler: Arc<dyn Handler>,
        at: InsertAt,
    ) -> Result<Option<Condition>, PipelineError> {
        self.check_mutable()?;
        // Absence check and insertion under one lock; two racing calls with
        // equal handlers must not both insert.
        let condition = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.iter().any(|e| e.handler.tag() == handler.tag()) {
                None
            } else {
                let entry = HandlerEntry::new(Arc::clone(&handler));
                let condition = Condition::for_entry(&entry);
                match at {
                    InsertAt::Front => entries.push_front(entry),
                    InsertAt::Back => entries.push_back(entry),
                }
                Some(condition)
            }
        };
        // Callbacks outside the entry lock; handlers may touch the pipeline.
        match condition {
            Some(condition) => {
                handler.on_registered();
                Ok(Some(condition))
            }
            None => {
                handler.on_registration_rejected();
                Ok(None)
            }
        }
    }

    /// Removes the entry whose handler carries `tag`. Returns whether an
    /// entry was removed.
    pub fn remove(&self, tag: &HandlerTag) -> Result<bool, PipelineError> {
        self.check_mutable()?;
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let position = entries.iter().position(|e| e.handler.tag() == tag);
            position.and_then(|idx| entries.remove(idx))
        };
        match removed {
            Some(entry) => {
                entry.handler.on_unregistered();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops every entry.
    pub fn clear(&self) -> Result<(), PipelineError> {
        self.check_mutable()?;
        let drained: Vec<HandlerEntry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain(..).collect()
        };
        for entry in &drained {
            entry.handler.on_unregistered();
        }
        Ok(())
    }

    /// Runs the chain for one message.
    ///
    /// Holds the pipeline's run lock for the whole invocation. Entries are
    /// visited in queue order; an entry fires only if all of its predicates
    /// pass. Faults (an `Err` or a panic out of a handler) are reported to
    /// the log and do not stop later entries. Returns the number of entries
    /// whose handler fired.
    pub fn run(
        &self,
        conn: &Arc<ConnectionHandle>,
        session: &Session,
        payload: &DynPayload,
    ) -> Result<usize, PipelineError> {
        let _exclusive = self.run_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.state() {
            PipelineState::Open => {}
            PipelineState::Closed => return Err(PipelineError::Closed(self.key)),
            PipelineState::Sealed => return Err(PipelineError::Sealed(self.key)),
        }

        // Snapshot so handlers may mutate the pipeline structure without
        // deadlocking against the entry lock.
        let snapshot: Vec<_> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.iter().map(HandlerEntry::snapshot).collect()
        };

        let mut fired = 0;
        for (handler, predicates) in snapshot {
            let admitted = {
                let preds = predicates.lock().unwrap_or_else(|e| e.into_inner());
                preds
                    .iter()
                    .all(|pred| pred(conn, session, payload.as_ref()))
            };
            if !admitted {
                continue;
            }
            fired += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.invoke(conn, session, payload.as_ref())
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => {
                    warn!(
                        target: "weft::pipeline",
                        key = %self.key,
                        handler = %handler.tag(),
                        %fault,
                        "handler fault isolated, continuing chain"
                    );
                }
                Err(_) => {
                    error!(
                        target: "weft::pipeline",
                        key = %self.key,
                        handler = %handler.tag(),
                        "handler panicked, continuing chain"
                    );
                }
            }
        }
        Ok(fired)
    }

    /// Closes the pipeline. Reversible via [`DispatchPipeline::open`].
    pub fn close(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == PipelineState::Sealed {
            return Err(PipelineError::Sealed(self.key));
        }
        *state = PipelineState::Closed;
        Ok(())
    }

    /// Reopens a closed pipeline.
    pub fn open(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == PipelineState::Sealed {
            return Err(PipelineError::Sealed(self.key));
        }
        *state = PipelineState::Open;
        Ok(())
    }

    /// Closes the pipeline forever. Terminal; `close`/`open` fail afterwards
    /// and the router's empty-pipeline sweep skips sealed pipelines.
    pub fn seal(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = PipelineState::Sealed;
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PipelineState::Closed
    }

    pub fn is_sealed(&self) -> bool {
        self.state() == PipelineState::Sealed
    }
}

impl fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("key", &self.key)
            .field("state", &self.state())
            .field(
                "entries",
                &self.entries.lock().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .finish()
    }
}
