//! Error taxonomy for the transport layer.

use thiserror::Error;

/// Errors surfaced by endpoints, the chunk receiver and the file
/// request client.
///
/// `Protocol` and `Decompression` indicate sender/receiver
/// desynchronization or data corruption. They are unrecoverable for the
/// affected transfer: callers must treat the in-flight transfer set as
/// poisoned and re-request from scratch. Nothing at this layer retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O failure on the underlying socket.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// No traffic within the configured timeout window, or a correlated
    /// response never arrived.
    #[error("connection timed out")]
    ConnectionTimedOut,

    /// Framing or message-format violation (bad chunk index, size
    /// mismatch, oversized declared length). Always fatal, never
    /// silently tolerated.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The fully assembled compressed buffer failed to decompress.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Send attempted on an endpoint that is dead or released.
    #[error("endpoint closed")]
    EndpointClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
