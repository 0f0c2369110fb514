//! Error types for the runtime store.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for store internals.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failures raised while loading or persisting the store document.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Filesystem access failed.
    #[error("runtime store io failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Document path.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// The document could not be encoded or decoded.
    #[error("runtime store document invalid")]
    Document {
        /// Document path.
        path: PathBuf,
        /// Source JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl RuntimeError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
