//! Error types for the vector index layer.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::vectors::EntityKind;

/// Why a pair of index files could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    VectorFileMissing,
    IdMapMissing,
    VectorFileUnreadable(String),
    IdMapUnreadable(String),
    /// The id map was written for a different vector blob.
    ChecksumMismatch,
    DimensionMismatch { expected: usize, found: usize },
    SizeMismatch { vectors: usize, ids: usize },
    /// The index loaded cleanly but disagrees with the record store.
    CountMismatch { index: usize, expected: usize },
    DuplicateIds,
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionReason::VectorFileMissing => write!(f, "vector file missing"),
            CorruptionReason::IdMapMissing => write!(f, "id map missing"),
            CorruptionReason::VectorFileUnreadable(e) => write!(f, "vector file unreadable: {}", e),
            CorruptionReason::IdMapUnreadable(e) => write!(f, "id map unreadable: {}", e),
            CorruptionReason::ChecksumMismatch => {
                write!(f, "id map checksum does not match vector file")
            }
            CorruptionReason::DimensionMismatch { expected, found } => {
                write!(f, "dimension mismatch: expected {}, got {}", expected, found)
            }
            CorruptionReason::SizeMismatch { vectors, ids } => write!(
                f,
                "size mismatch: {} vectors but {} id map entries",
                vectors, ids
            ),
            CorruptionReason::CountMismatch { index, expected } => write!(
                f,
                "count mismatch: index has {} vectors, record store expects {}",
                index, expected
            ),
            CorruptionReason::DuplicateIds => write!(f, "id map contains duplicate entity ids"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index `{0}` has not been created")]
    Missing(EntityKind),

    #[error("dimension mismatch: index expects {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("got {vectors} vectors but {ids} entity ids")]
    LengthMismatch { vectors: usize, ids: usize },

    #[error("index files for `{kind}` are corrupt: {reason}")]
    Corrupt {
        kind: EntityKind,
        reason: CorruptionReason,
    },

    /// Writing an index to durable storage failed. This is the one failure
    /// the manager never recovers from on its own.
    #[error("failed to persist `{kind}` index to {path:?}: {source}")]
    Persist {
        kind: EntityKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source of truth unavailable for `{kind}`: {message}")]
    SourceUnavailable { kind: EntityKind, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error(transparent)]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
