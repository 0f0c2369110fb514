use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cinder_torrent_core::{TorrentError, TorrentResult};

use super::{Inner, SessionController};
use crate::error::{SessionError, SessionResult};
use crate::watcher::IngestTarget;

/// Routes watched-directory files into the controller's add path.
pub(super) struct ControllerIngest {
    inner: Weak<Inner>,
}

impl ControllerIngest {
    pub(super) fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    fn controller(&self, operation: &'static str) -> SessionResult<SessionController> {
        self.inner
            .upgrade()
            .map(SessionController::from_inner)
            .ok_or_else(|| {
                SessionError::torrent(operation, TorrentError::EngineUnavailable { operation })
            })
    }
}

#[async_trait]
impl IngestTarget for ControllerIngest {
    async fn ingest(&self, path: &Path) -> SessionResult<()> {
        let controller = self.controller("add_torrent_file")?;
        match controller.add_torrent_file(path, None).await? {
            Some(_) => Ok(()),
            None => Err(SessionError::torrent(
                "add_torrent_file",
                TorrentError::EngineUnavailable {
                    operation: "add_torrent_file",
                },
            )),
        }
    }

    fn discard(&self, path: &Path) -> TorrentResult<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or(TorrentError::EngineUnavailable {
                operation: "discard",
            })?;
        inner.deps.fs.delete(path)
    }
}
