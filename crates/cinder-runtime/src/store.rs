//! JSON document backed task repository.
//!
//! # Design
//! - Records live in memory; every mutation rewrites the whole document
//!   through a temp file and rename so a crash never leaves half a file.
//! - Mutations are serialized by an async write lock, which keeps the order of
//!   persisted snapshots equal to the order of mutations.
//! - Per-id `watch` channels are created lazily and updated after each
//!   successful mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cinder_events::InfoHash;
use cinder_torrent_core::{Torrent, TorrentError, TorrentRepository, TorrentResult};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};

/// Default document file name inside a data directory.
pub const STORE_FILE_NAME: &str = "torrents.json";

type Records = HashMap<InfoHash, Torrent>;

/// Task repository persisted as a single JSON document.
pub struct RuntimeStore {
    path: Option<PathBuf>,
    records: Mutex<Records>,
    watchers: Mutex<HashMap<InfoHash, watch::Sender<Option<Torrent>>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl RuntimeStore {
    /// Store that never touches the filesystem.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_records(None, Records::new())
    }

    /// Open (or create on first write) the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => decode(&path, &bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(err) => return Err(RuntimeError::io("open", &path, err)),
        };
        info!(path = %path.display(), count = records.len(), "runtime store opened");
        Ok(Self::with_records(Some(path), records))
    }

    fn with_records(path: Option<PathBuf>, records: Records) -> Self {
        Self {
            path,
            records: Mutex::new(records),
            watchers: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing document, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<InfoHash, watch::Sender<Option<Torrent>>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to the records and persist the result.
    async fn mutate<F>(&self, operation: &'static str, id: &InfoHash, change: F) -> TorrentResult<()>
    where
        F: FnOnce(&mut Records) -> TorrentResult<Option<Torrent>>,
    {
        let _write = self.write_lock.lock().await;
        let (current, snapshot) = {
            let mut records = self.lock_records();
            let current = change(&mut records)?;
            (current, self.path.is_some().then(|| sorted(&records)))
        };

        if let (Some(path), Some(snapshot)) = (self.path.as_deref(), snapshot) {
            persist(path, &snapshot)
                .await
                .map_err(|err| TorrentError::operation_failed(operation, Some(id.clone()), err))?;
        }
        debug!(torrent_id = %id, operation, "runtime store updated");

        if let Some(sender) = self.lock_watchers().get(id) {
            sender.send_replace(current);
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentRepository for RuntimeStore {
    async fn insert(&self, torrent: Torrent) -> TorrentResult<()> {
        let id = torrent.id.clone();
        self.mutate("insert", &id, move |records| {
            if records.contains_key(&torrent.id) {
                return Err(TorrentError::AlreadyExists {
                    torrent_id: torrent.id,
                });
            }
            records.insert(torrent.id.clone(), torrent.clone());
            Ok(Some(torrent))
        })
        .await
    }

    async fn update(&self, torrent: Torrent) -> TorrentResult<()> {
        let id = torrent.id.clone();
        self.mutate("update", &id, move |records| {
            let Some(slot) = records.get_mut(&torrent.id) else {
                return Err(TorrentError::NotFound {
                    torrent_id: torrent.id,
                });
            };
            *slot = torrent.clone();
            Ok(Some(torrent))
        })
        .await
    }

    async fn delete(&self, id: &InfoHash) -> TorrentResult<()> {
        self.mutate("delete", id, |records| {
            records.remove(id);
            Ok(None)
        })
        .await
    }

    async fn get(&self, id: &InfoHash) -> TorrentResult<Option<Torrent>> {
        Ok(self.lock_records().get(id).cloned())
    }

    async fn all(&self) -> TorrentResult<Vec<Torrent>> {
        Ok(sorted(&self.lock_records()))
    }

    fn watch(&self, id: &InfoHash) -> watch::Receiver<Option<Torrent>> {
        let current = self.lock_records().get(id).cloned();
        self.lock_watchers()
            .entry(id.clone())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }
}

/// Records ordered by date added, then id.
fn sorted(records: &Records) -> Vec<Torrent> {
    let mut list: Vec<Torrent> = records.values().cloned().collect();
    list.sort_by(|left, right| {
        left.date_added
            .cmp(&right.date_added)
            .then_with(|| left.id.cmp(&right.id))
    });
    list
}

fn decode(path: &Path, bytes: &[u8]) -> RuntimeResult<Records> {
    let list: Vec<Torrent> =
        serde_json::from_slice(bytes).map_err(|source| RuntimeError::Document {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(list
        .into_iter()
        .map(|torrent| (torrent.id.clone(), torrent))
        .collect())
}

async fn persist(path: &Path, records: &[Torrent]) -> RuntimeResult<()> {
    let encoded = serde_json::to_vec_pretty(records).map_err(|source| RuntimeError::Document {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| RuntimeError::io("create_dir", parent, err))?;
    }
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, encoded)
        .await
        .map_err(|err| RuntimeError::io("write", &staging, err))?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|err| RuntimeError::io("rename", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::parse(&format!("{byte:02x}").repeat(20)).expect("valid hash")
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() -> anyhow::Result<()> {
        let store = RuntimeStore::in_memory();
        store.insert(Torrent::new(hash(1), "one", "/data")).await?;
        let err = store
            .insert(Torrent::new(hash(1), "again", "/data"))
            .await
            .expect_err("duplicate");
        assert!(err.is_already_exists());
        assert_eq!(store.all().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = RuntimeStore::in_memory();
        let err = store
            .update(Torrent::new(hash(2), "ghost", "/data"))
            .await
            .expect_err("missing");
        assert!(matches!(err, TorrentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn watchers_follow_mutations() -> anyhow::Result<()> {
        let store = RuntimeStore::in_memory();
        let id = hash(3);
        let mut watcher = store.watch(&id);
        assert!(watcher.borrow_and_update().is_none());

        store.insert(Torrent::new(id.clone(), "three", "/data")).await?;
        watcher.changed().await?;
        assert_eq!(
            watcher.borrow_and_update().as_ref().map(|t| t.name.clone()),
            Some("three".to_string())
        );

        let mut renamed = store.get(&id).await?.expect("record");
        renamed.name = "renamed".into();
        store.update(renamed).await?;
        watcher.changed().await?;
        assert_eq!(
            watcher.borrow_and_update().as_ref().map(|t| t.name.clone()),
            Some("renamed".to_string())
        );

        store.delete(&id).await?;
        watcher.changed().await?;
        assert!(watcher.borrow().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let store = RuntimeStore::in_memory();
        store.delete(&hash(4)).await?;
        Ok(())
    }
}
