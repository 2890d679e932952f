//! Wire framing and the explicit payload decode registry.
//!
//! A frame on the wire is `(TypeKey, payload bytes)`. The frame envelope is
//! always bincode; the payload bytes inside are produced and consumed by
//! whatever each message type registered. Decoding is driven by an explicit
//! per-key registry instead of deriving types from the wire, so an endpoint
//! only ever materializes messages it opted into.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::handler::DynPayload;
use crate::key::{TypeKey, TypedMessage};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("frame decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("no decoder registered for {0}")]
    UnknownKey(TypeKey),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// One framed message: the dispatch key plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub key: TypeKey,
    pub payload: Vec<u8>,
}

/// Frame-level encoding. Object safe so transports can hold a boxed
/// serializer without knowing the concrete codec.
pub trait MessageSerializer: Send + Sync {
    fn encode_frame(&self, frame: &WireFrame) -> Result<Vec<u8>, CodecError>;
    fn decode_frame(&self, bytes: &[u8]) -> Result<WireFrame, CodecError>;
}

/// Default serializer: bincode with the standard configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        let (value, _len) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(value)
    }
}

impl MessageSerializer for BincodeSerializer {
    fn encode_frame(&self, frame: &WireFrame) -> Result<Vec<u8>, CodecError> {
        Self::encode(frame)
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<WireFrame, CodecError> {
        Self::decode(bytes)
    }
}

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<DynPayload, CodecError> + Send + Sync>;

/// Registry of payload decoders, keyed by [`TypeKey`].
///
/// Types are registered explicitly, typically right next to their router
/// registration. A frame whose key has no decoder is a [`CodecError`]
/// surfaced to the reader loop, never a crash.
#[derive(Default)]
pub struct PayloadCodec {
    decoders: RwLock<HashMap<TypeKey, DecodeFn>>,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the bincode decoder for `T` under `T::KEY`. Re-registering
    /// the same key replaces the previous decoder.
    pub fn register<T>(&self)
    where
        T: TypedMessage + DeserializeOwned,
    {
        let decode: DecodeFn = Arc::new(|bytes| {
            let value: T = BincodeSerializer::decode(bytes)?;
            Ok(Arc::new(value) as DynPayload)
        });
        self.decoders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(T::KEY, decode);
        debug!(target: "weft::codec", key = %T::KEY, "payload decoder registered");
    }

    pub fn unregister(&self, key: TypeKey) {
        self.decoders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn can_decode(&self, key: TypeKey) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }

    /// Decodes `frame.payload` into the type registered for `frame.key`.
    pub fn decode(&self, frame: &WireFrame) -> Result<DynPayload, CodecError> {
        let decoder = {
            let map = self.decoders.read().unwrap_or_else(|e| e.into_inner());
            map.get(&frame.key).cloned()
        };
        match decoder {
            Some(decode) => decode(&frame.payload),
            None => Err(CodecError::UnknownKey(frame.key)),
        }
    }

    /// Encodes `value` into a frame under its own key.
    pub fn encode<T>(&self, value: &T) -> Result<WireFrame, CodecError>
    where
        T: TypedMessage + Serialize,
    {
        Ok(WireFrame {
            key: T::KEY,
            payload: BincodeSerializer::encode(value)?,
        })
    }
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field(
                "decoders",
                &self.decoders.read().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .finish()
    }
}
