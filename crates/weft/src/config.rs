//! Endpoint configuration.

use std::time::Duration;

use serde::Deserialize;

/// Tunables for one endpoint. Deserializable so embeddings can load it from
/// their own settings files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Inbound frames larger than this are rejected before decoding.
    pub max_frame_bytes: usize,
    /// Threads in the pool built by `Endpoint::with_tokio_pool`.
    pub worker_threads: usize,
    pub handshake: HandshakeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Timeout used by `Endpoint::wait_established`. The coordinator itself
    /// imposes no timeout.
    pub establish_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            worker_threads: 4,
            handshake: HandshakeConfig::default(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            establish_timeout: Duration::from_secs(10),
        }
    }
}
