//! Error taxonomy for the transport layer.

use thiserror::Error;

use crate::request::OpStatus;

/// Errors produced across setup, rendezvous, and data-plane operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid arguments or an out-of-band socket failure.
    #[error("setup failed: {reason}")]
    Setup { reason: String },

    /// Malformed or truncated handshake record on the rendezvous stream.
    #[error("handshake framing error: {reason}")]
    Framing { reason: String },

    /// Context or worker creation failed.
    #[error("transport init failed: {reason}")]
    Init { reason: String },

    /// Memory registration failed.
    #[error("memory registration failed: {reason}")]
    Registration { reason: String },

    /// Endpoint creation or use failed before a request went live.
    #[error("endpoint error: {reason}")]
    Endpoint { reason: String },

    /// A request reached a terminal status other than success.
    #[error("operation completed with status {status:?}")]
    Operation {
        /// Terminal status reported by the fabric.
        status: OpStatus,
    },

    /// Receive buffer is smaller than the matched message.
    #[error("receive buffer too small: message is {needed} bytes, buffer is {got}")]
    MessageTruncated { needed: usize, got: usize },

    /// Invalid magic number on a data-plane frame.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Data-plane protocol version mismatch.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    /// Declared payload length exceeds the configured cap.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    /// Frame or blob (de)serialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TransportError>;
