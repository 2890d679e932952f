//! Stable dispatch keys for typed messages.
//!
//! A [`TypeKey`] plays a double role: it selects the handler pipeline a
//! decoded payload is routed to, and it names the multiplexed connection a
//! payload travels over. Keys are declared statically per message type via
//! [`TypedMessage`] instead of being derived from runtime type information,
//! so the router can validate the key/type binding once at registration.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, totally ordered, hashable identifier for a message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey(u32);

impl TypeKey {
    /// First key of the range reserved for connection-establishment control
    /// messages. Application messages must stay below this range.
    pub const CONTROL_RANGE_START: u32 = 0xFFFF_FF00;

    /// Key of the default connection every session starts with.
    pub const DEFAULT_CONNECTION: TypeKey = TypeKey(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// True for keys inside the reserved control range.
    pub const fn is_control(self) -> bool {
        self.0 >= Self::CONTROL_RANGE_START
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{:#010x}", self.0)
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({:#010x})", self.0)
    }
}

/// A message type with a statically declared dispatch key.
///
/// The key must be unique per concrete type within one router; the router
/// enforces this when the type is registered.
pub trait TypedMessage: Any + Send + Sync {
    const KEY: TypeKey;
}
