//! Error types for seqlink.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all seqlink operations.
#[derive(Debug, Error)]
pub enum SeqlinkError {
    /// I/O error during dial, accept, read or write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame (length mismatch, truncated header, bad line format).
    #[error("Decode error: {0}")]
    Decode(String),

    /// Payload cannot be represented in a single frame.
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload length.
        len: usize,
        /// Largest payload the codec accepts.
        max: usize,
    },

    /// Outbound queue is at capacity.
    #[error("Write queue full")]
    QueueFull,

    /// Session (or server) is closed.
    #[error("Connection closed")]
    Closed,

    /// `sync_write` did not receive a response in time.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Every candidate sequence id is still held by a pending call.
    #[error("No free sequence id available")]
    SeqExhausted,

    /// The result slot was dropped before a value was delivered.
    #[error("Pending call {0} was abandoned")]
    CallAbandoned(i32),

    /// Reconnect attempts exceeded the retry cap.
    #[error("Reconnect to {target} abandoned after {attempts} attempts")]
    ReconnectExhausted {
        /// Address of the target.
        target: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Configuration rejected by `Config::validate`.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `listen_and_serve` called on a server that is already listening.
    #[error("Server is already listening")]
    AlreadyListening,

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Result type alias using SeqlinkError.
pub type Result<T> = std::result::Result<T, SeqlinkError>;
