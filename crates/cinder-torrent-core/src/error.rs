//! Error types for torrent core services.

use std::error::Error;
use std::io;
use std::path::PathBuf;

use cinder_events::InfoHash;
use thiserror::Error;

/// Primary error type for task operations.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// A task with the same content hash is already tracked.
    #[error("torrent already exists")]
    AlreadyExists {
        /// Hash of the existing task.
        torrent_id: InfoHash,
    },
    /// A descriptor or metadata payload could not be decoded.
    #[error("torrent metadata could not be decoded")]
    DecodeFailure {
        /// Human-readable decode failure.
        reason: String,
    },
    /// The destination lacks room for the payload.
    #[error("insufficient free space")]
    InsufficientSpace {
        /// Bytes the payload needs.
        required: u64,
        /// Bytes available at the destination.
        available: u64,
    },
    /// The add locator uses an unsupported scheme.
    #[error("unknown torrent source")]
    UnknownSource {
        /// Locator as supplied by the caller.
        locator: String,
    },
    /// The engine is not running.
    #[error("torrent engine unavailable")]
    EngineUnavailable {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Task was not found.
    #[error("torrent not found")]
    NotFound {
        /// Missing task identifier.
        torrent_id: InfoHash,
    },
    /// Filesystem access failed.
    #[error("torrent io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Operation failed in the underlying engine.
    #[error("torrent operation failed")]
    OperationFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Task identifier when available.
        torrent_id: Option<InfoHash>,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl TorrentError {
    /// Build an IO error with context.
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build a decode failure from any displayable cause.
    #[must_use]
    pub fn decode(reason: impl ToString) -> Self {
        Self::DecodeFailure {
            reason: reason.to_string(),
        }
    }

    /// Build an engine failure with context.
    #[must_use]
    pub fn operation_failed(
        operation: &'static str,
        torrent_id: Option<InfoHash>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::OperationFailed {
            operation,
            torrent_id,
            source: source.into(),
        }
    }

    /// `true` for the duplicate-add outcome that ingestion treats as success.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Convenience alias for task operation results.
pub type TorrentResult<T> = Result<T, TorrentError>;
