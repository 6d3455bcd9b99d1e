//! Crate-wide error type and `Result` alias.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AutoAssistError>;

/// Errors surfaced by the indexing and retrieval engine.
///
/// Manufacturer detection never returns these; a failed detection is a
/// normal `None`. Persistence errors abort the current operation and leave
/// any previously published snapshot untouched.
#[derive(Debug, Error)]
pub enum AutoAssistError {
    /// Retrieval was attempted before any index snapshot was published.
    #[error("no index snapshot has been published under {path}")]
    IndexUnavailable { path: PathBuf },

    /// An index build found zero passages across all partitions.
    #[error("corpus contains no passages; refusing to build an empty index")]
    CorpusEmpty,

    /// A search request failed basic validation.
    #[error("invalid search request: {reason}")]
    InvalidQuery { reason: String },

    /// A published snapshot is missing artifacts or internally inconsistent.
    #[error("index snapshot is corrupt: {reason}")]
    SnapshotCorrupt { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("snapshot decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
