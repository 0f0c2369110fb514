//! # Design
//!
//! - Centralize session-level errors for lifecycle, dispatch and ingestion.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve engine errors as sources so callers can match on the taxonomy.

use std::path::PathBuf;

use cinder_torrent_core::TorrentError;
use thiserror::Error;

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session-level error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An engine or store operation failed.
    #[error("torrent operation failed")]
    Torrent {
        /// Operation identifier.
        operation: &'static str,
        /// Source torrent error.
        #[source]
        source: TorrentError,
    },
    /// The task dispatcher no longer accepts work.
    #[error("task dispatcher closed")]
    DispatcherClosed {
        /// Operation that could not be queued.
        operation: &'static str,
    },
    /// A dispatcher unit panicked.
    #[error("task unit panicked")]
    UnitPanicked {
        /// Unit label.
        operation: &'static str,
    },
    /// The directory watch could not be established.
    #[error("directory watch failed")]
    Watch {
        /// Directory being watched.
        path: PathBuf,
        /// Source notify error.
        #[source]
        source: notify::Error,
    },
    /// The controller was created outside a tokio runtime.
    #[error("tokio runtime unavailable")]
    RuntimeUnavailable,
}

impl SessionError {
    /// Wrap a torrent error with the failing operation.
    #[must_use]
    pub const fn torrent(operation: &'static str, source: TorrentError) -> Self {
        Self::Torrent { operation, source }
    }

    /// Underlying torrent error, when there is one.
    #[must_use]
    pub const fn torrent_error(&self) -> Option<&TorrentError> {
        match self {
            Self::Torrent { source, .. } => Some(source),
            _ => None,
        }
    }

    /// `true` when the engine was not running.
    #[must_use]
    pub const fn is_engine_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Torrent {
                source: TorrentError::EngineUnavailable { .. },
                ..
            }
        )
    }
}
