//! Collaborator traits the session layer drives.
//!
//! # Design
//! - The transfer engine is a black box: it owns wire protocol, metadata
//!   decoding and task state, and reports back by publishing on the
//!   [`ListenerBus`] it is attached to.
//! - Per-task accessors live on [`TaskHandle`] so read-only queries can run
//!   without going through the mutation queue.
//! - Store, filesystem, streaming, completion and environment seams are
//!   narrow traits so tests can substitute in-memory doubles.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cinder_events::{InfoHash, ListenerBus};
use tokio::sync::{broadcast, watch};

use crate::error::{TorrentError, TorrentResult};
use crate::model::{
    AddTorrentParams, FilePriority, MagnetInfo, MediaFile, SessionSettings, SpeedLimits,
    TaskStatus, Torrent, TorrentMetaInfo,
};

/// External transfer engine.
///
/// Start and metadata fetches complete asynchronously: the engine publishes
/// `SessionStarted` and `MagnetMetadata` on the attached bus once ready.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Attach the bus engine callbacks are published on.
    fn attach(&self, bus: ListenerBus);

    /// Ask the engine to start with `settings`. Returns before the session is up.
    async fn start(&self, settings: SessionSettings) -> TorrentResult<()>;

    /// Ask the engine to stop.
    async fn request_stop(&self) -> TorrentResult<()>;

    /// Whether the engine session is currently up.
    fn is_running(&self) -> bool;

    /// Admit a new task, persisting it in the store.
    ///
    /// Fails with [`TorrentError::AlreadyExists`] when the hash is tracked.
    /// When `remove_file` is set a file source is deleted after admission.
    async fn add_task(&self, params: AddTorrentParams, remove_file: bool) -> TorrentResult<Torrent>;

    /// Handle for a live task.
    fn task(&self, id: &InfoHash) -> Option<Arc<dyn TaskHandle>>;

    /// Hashes of every live task.
    fn task_ids(&self) -> Vec<InfoHash>;

    /// Remove a task and its store record, optionally deleting payload files.
    async fn delete_task(&self, id: &InfoHash, with_files: bool) -> TorrentResult<()>;

    /// Start fetching metadata for a magnet.
    async fn fetch_metadata(&self, magnet: &MagnetInfo) -> TorrentResult<()>;

    /// Raw metadata already held for `hash`.
    fn cached_metadata(&self, hash: &InfoHash) -> Option<Vec<u8>>;

    /// Abandon an in-progress metadata fetch.
    async fn cancel_fetch(&self, hash: &InfoHash) -> TorrentResult<()>;

    /// Decode a raw descriptor or metadata payload.
    fn decode_metadata(&self, bytes: &[u8]) -> TorrentResult<TorrentMetaInfo>;

    /// Load every persisted task back into the engine.
    async fn restore_all(&self) -> TorrentResult<()>;

    /// Pause every task because of scheduling policy.
    async fn pause_all(&self) -> TorrentResult<()>;

    /// Resume tasks paused by scheduling policy.
    async fn resume_all(&self) -> TorrentResult<()>;

    /// Pause every task at the user's request.
    async fn pause_all_manually(&self) -> TorrentResult<()> {
        self.pause_all().await
    }

    /// Resume every task at the user's request.
    async fn resume_all_manually(&self) -> TorrentResult<()> {
        self.resume_all().await
    }

    /// Current engine settings.
    fn settings(&self) -> SessionSettings;

    /// Replace engine settings.
    async fn apply_settings(&self, settings: SessionSettings) -> TorrentResult<()>;

    /// Load an IP filter rule file. The engine publishes `IpFilterParsed`.
    async fn enable_ip_filter(&self, path: &Path) -> TorrentResult<()> {
        let _ = path;
        Err(TorrentError::EngineUnavailable {
            operation: "enable_ip_filter",
        })
    }

    /// Tasks still transferring payload.
    fn active_downloads(&self) -> usize;
}

/// Accessors and mutators for a single live task.
pub trait TaskHandle: Send + Sync {
    /// Content hash.
    fn id(&self) -> InfoHash;
    /// Live status snapshot.
    fn status(&self) -> TaskStatus;
    /// Whether the task is paused for any reason.
    fn is_paused(&self) -> bool;
    /// Whether the task finished downloading.
    fn is_finished(&self) -> bool;
    /// Pause because of scheduling policy.
    fn pause(&self) -> TorrentResult<()>;
    /// Resume after a policy pause.
    fn resume(&self) -> TorrentResult<()>;
    /// Pause at the user's request.
    fn pause_manually(&self) -> TorrentResult<()>;
    /// Resume at the user's request.
    fn resume_manually(&self) -> TorrentResult<()>;
    /// Re-verify payload data on disk.
    fn force_recheck(&self) -> TorrentResult<()>;
    /// Announce to every tracker now.
    fn force_announce(&self) -> TorrentResult<()>;
    /// Current tracker URLs.
    fn trackers(&self) -> BTreeSet<String>;
    /// Add tracker URLs to the existing set.
    fn add_trackers(&self, urls: &BTreeSet<String>) -> TorrentResult<()>;
    /// Replace the tracker set.
    fn replace_trackers(&self, urls: &BTreeSet<String>) -> TorrentResult<()>;
    /// Rename the task.
    fn set_name(&self, name: &str) -> TorrentResult<()>;
    /// Move payload storage. The engine publishes `TaskMoving` / `TaskMoved`.
    fn set_download_path(&self, path: &Path) -> TorrentResult<()>;
    /// Whether pieces download in order.
    fn is_sequential(&self) -> bool;
    /// Toggle in-order piece download.
    fn set_sequential(&self, sequential: bool) -> TorrentResult<()>;
    /// Whether first/last piece priority is on.
    fn is_first_last_piece_priority(&self) -> bool;
    /// Toggle first/last piece priority.
    fn set_first_last_piece_priority(&self, enabled: bool) -> TorrentResult<()>;
    /// Current per-file priorities.
    fn file_priorities(&self) -> Vec<FilePriority>;
    /// Replace per-file priorities.
    fn prioritize_files(&self, priorities: &[FilePriority]) -> TorrentResult<()>;
    /// Per-task rate limits.
    fn speed_limits(&self) -> SpeedLimits;
    /// Replace per-task rate limits.
    fn set_speed_limits(&self, limits: SpeedLimits) -> TorrentResult<()>;
    /// Resolved metadata, absent until a magnet fetch completes.
    fn metainfo(&self) -> Option<TorrentMetaInfo>;
    /// Export a magnet URI, optionally carrying file priorities.
    fn make_magnet(&self, include_priorities: bool) -> String;
    /// Absolute path of payload file `index`.
    fn file_path(&self, index: usize) -> Option<PathBuf>;

    /// Playable files in payload order; empty until metadata is known.
    ///
    /// A file counts as downloaded once the whole task finished.
    fn media_files(&self) -> Vec<MediaFile> {
        let Some(meta) = self.metainfo() else {
            return Vec::new();
        };
        let downloaded = self.is_finished();
        meta.files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.is_media())
            .filter_map(|(index, file)| {
                Some(MediaFile {
                    torrent_id: self.id(),
                    index,
                    path: self.file_path(index)?,
                    size: file.size,
                    downloaded,
                })
            })
            .collect()
    }

    /// Whether the task was added with a request to stream right away.
    fn stream_on_add(&self) -> bool {
        false
    }
}

/// Persistent task store.
#[async_trait]
pub trait TorrentRepository: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, torrent: Torrent) -> TorrentResult<()>;
    /// Replace an existing record.
    async fn update(&self, torrent: Torrent) -> TorrentResult<()>;
    /// Remove a record; absent ids are ignored.
    async fn delete(&self, id: &InfoHash) -> TorrentResult<()>;
    /// Fetch a record by id.
    async fn get(&self, id: &InfoHash) -> TorrentResult<Option<Torrent>>;
    /// Every record, oldest first.
    async fn all(&self) -> TorrentResult<Vec<Torrent>>;
    /// Observe a single record; the receiver sees `None` after deletion.
    fn watch(&self, id: &InfoHash) -> watch::Receiver<Option<Torrent>>;
}

/// Storage-backend agnostic file access.
pub trait FileSystemFacade: Send + Sync {
    /// Read a whole file.
    fn read(&self, path: &Path) -> TorrentResult<Vec<u8>>;
    /// Write `bytes` to `path`, replacing it.
    fn write(&self, path: &Path, bytes: &[u8]) -> TorrentResult<()>;
    /// Remove a file.
    fn delete(&self, path: &Path) -> TorrentResult<()>;
    /// Create `dir/name`; with `overwrite` unset an existing file gets a numbered name.
    fn create_file(&self, dir: &Path, name: &str, overwrite: bool) -> TorrentResult<PathBuf>;
    /// Free bytes at `path`.
    fn available_bytes(&self, path: &Path) -> TorrentResult<u64>;
    /// Platform default download directory.
    fn default_download_path(&self) -> PathBuf;
    /// Remove everything under the scratch directory.
    fn clean_temp_dir(&self) -> TorrentResult<()>;
}

/// Local HTTP endpoint that streams task payload files.
#[async_trait]
pub trait StreamingEndpoint: Send + Sync {
    /// Bind and serve on `host:port`.
    async fn start(&self, host: &str, port: u16) -> TorrentResult<()>;
    /// Stop serving; a no-op when not started.
    async fn stop(&self);
}

/// Build the URL a streaming endpoint on `host:port` serves `file_index` of `id` at.
#[must_use]
pub fn stream_url(host: &str, port: u16, id: &InfoHash, file_index: usize) -> String {
    format!("http://{host}:{port}/stream/{id}/{file_index}")
}

/// Fires when every active task has finished downloading.
pub trait CompletionSignal: Send + Sync {
    /// Subscribe to completion notifications.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Environmental conditions relevant to scheduling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentReadings {
    /// Battery charge in percent.
    pub battery_level: f32,
    /// External power attached.
    pub is_charging: bool,
    /// Active network is metered.
    pub is_metered: bool,
    /// Active network is roaming.
    pub is_roaming: bool,
}

impl Default for EnvironmentReadings {
    fn default() -> Self {
        Self {
            battery_level: 100.0,
            is_charging: true,
            is_metered: false,
            is_roaming: false,
        }
    }
}

/// Source of live environmental readings.
pub trait EnvironmentProbe: Send + Sync {
    /// Current readings.
    fn readings(&self) -> EnvironmentReadings;
}

/// Probe reporting fixed readings; used on hosts without power or network sensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEnvironment(pub EnvironmentReadings);

impl EnvironmentProbe for StaticEnvironment {
    fn readings(&self) -> EnvironmentReadings {
        self.0
    }
}
