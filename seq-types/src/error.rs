//! Error types for chatseq wire handling.

use thiserror::Error;

/// Errors that can occur while encoding, decoding or parsing chatseq types.
#[derive(Debug, Error)]
pub enum SeqError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// An identifier could not be parsed
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A channel name could not be parsed
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
