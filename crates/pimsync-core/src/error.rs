//! Error types for pimsync-core

use thiserror::Error;

/// Result type alias using pimsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pimsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal record could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Journal header carries a version this build cannot read
    #[error("Unsupported journal format version {0}")]
    UnsupportedVersion(u16),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The task serving a recorder has shut down
    #[error("Recorder task has stopped")]
    RecorderStopped,
}

/// Record-level corruption found while reading a journal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown notification type tag {0}")]
    UnknownType(i32),

    #[error("negative entity count {0}")]
    NegativeCount(i32),

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("relation records cannot be read from format version {0}")]
    UnreadableRelation(u16),
}
