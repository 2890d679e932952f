//! Message handlers and the adapters that normalize their calling shapes.
//!
//! Registration accepts three handler shapes (payload-only, session+payload,
//! connection+session+payload). All of them are normalized here, once, into
//! the single three-argument [`Handler::invoke`] convention so the dispatch
//! path never inspects handler shape at runtime.

use std::any::{Any, type_name};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::connection::ConnectionHandle;
use crate::key::TypedMessage;
use crate::session::Session;

/// Payload as it travels through the dispatch path: decoded once by the
/// codec, shared between pipeline entries and fallback handlers.
pub type DynPayload = Arc<dyn Any + Send + Sync>;

/// Identity of a registered handler.
///
/// Tags carry the equality contract used by `add_*_if_absent` and `remove`:
/// two handlers are "the same" exactly when their tags are equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HandlerTag(Cow<'static, str>);

impl HandlerTag {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for HandlerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerTag({})", self.0)
    }
}

impl From<&'static str> for HandlerTag {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

/// A consumer of dispatched messages.
///
/// Faults are reported through the `Err` channel and isolated by the
/// pipeline; they never abort the remaining entries of a chain.
pub trait Handler: Send + Sync {
    fn tag(&self) -> &HandlerTag;

    fn invoke(
        &self,
        conn: &Arc<ConnectionHandle>,
        session: &Session,
        payload: &dyn Any,
    ) -> anyhow::Result<()>;

    /// Called after the handler was inserted into a pipeline.
    fn on_registered(&self) {}

    /// Called after the handler was removed from a pipeline.
    fn on_unregistered(&self) {}

    /// Called when an `add_*_if_absent` insertion found an equal handler
    /// already present and dropped this one.
    fn on_registration_rejected(&self) {}
}

type NormalizedFn =
    Box<dyn Fn(&Arc<ConnectionHandle>, &Session, &dyn Any) -> anyhow::Result<()> + Send + Sync>;

/// Closure-backed handler. Built through the shape-specific constructors;
/// the shape is erased here and never looked at again.
pub struct FnHandler {
    tag: HandlerTag,
    f: NormalizedFn,
}

impl FnHandler {
    /// Payload-only shape.
    pub fn payload<T, F>(tag: impl Into<HandlerTag>, f: F) -> Arc<dyn Handler>
    where
        T: TypedMessage,
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::try_payload(tag, move |payload: &T| {
            f(payload);
            Ok(())
        })
    }

    /// Session+payload shape.
    pub fn with_session<T, F>(tag: impl Into<HandlerTag>, f: F) -> Arc<dyn Handler>
    where
        T: TypedMessage,
        F: Fn(&Session, &T) + Send + Sync + 'static,
    {
        Arc::new(Self {
            tag: tag.into(),
            f: Box::new(move |_conn, session, payload| {
                f(session, downcast_payload::<T>(payload)?);
                Ok(())
            }),
        })
    }

    /// Connection+session+payload shape.
    pub fn full<T, F>(tag: impl Into<HandlerTag>, f: F) -> Arc<dyn Handler>
    where
        T: TypedMessage,
        F: Fn(&Arc<ConnectionHandle>, &Session, &T) + Send + Sync + 'static,
    {
        Self::try_full(tag, move |conn: &Arc<ConnectionHandle>, session, payload: &T| {
            f(conn, session, payload);
            Ok(())
        })
    }

    /// Fallible payload-only shape.
    pub fn try_payload<T, F>(tag: impl Into<HandlerTag>, f: F) -> Arc<dyn Handler>
    where
        T: TypedMessage,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            tag: tag.into(),
            f: Box::new(move |_conn, _session, payload| f(downcast_payload::<T>(payload)?)),
        })
    }

    /// Fallible connection+session+payload shape.
    pub fn try_full<T, F>(tag: impl Into<HandlerTag>, f: F) -> Arc<dyn Handler>
    where
        T: TypedMessage,
        F: Fn(&Arc<ConnectionHandle>, &Session, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            tag: tag.into(),
            f: Box::new(move |conn, session, payload| {
                f(conn, session, downcast_payload::<T>(payload)?)
            }),
        })
    }
}

impl Handler for FnHandler {
    fn tag(&self) -> &HandlerTag {
        &self.tag
    }

    fn invoke(
        &self,
        conn: &Arc<ConnectionHandle>,
        session: &Session,
        payload: &dyn Any,
    ) -> anyhow::Result<()> {
        (self.f)(conn, session, payload)
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("tag", &self.tag).finish()
    }
}

fn downcast_payload<T: TypedMessage>(payload: &dyn Any) -> anyhow::Result<&T> {
    payload
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("payload is not a {}", type_name::<T>()))
}
