//! Core task domain types shared across the workspace.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cinder_events::InfoHash;
use serde::{Deserialize, Serialize};

/// Persisted transfer task record owned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Torrent {
    /// Content hash identity.
    pub id: InfoHash,
    /// Display name.
    pub name: String,
    /// Directory the payload is written into.
    pub download_path: PathBuf,
    /// When the task was first added.
    pub date_added: DateTime<Utc>,
    /// Last error reported by the engine.
    #[serde(default)]
    pub error: Option<String>,
    /// Visibility flag for list views.
    #[serde(default)]
    pub visibility: Visibility,
}

impl Torrent {
    /// Construct a visible, error-free task record stamped with the current time.
    #[must_use]
    pub fn new(id: InfoHash, name: impl Into<String>, download_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            download_path: download_path.into(),
            date_added: Utc::now(),
            error: None,
            visibility: Visibility::Normal,
        }
    }
}

/// List visibility of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Normal,
    Hidden,
}

/// How a task payload descriptor is supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TorrentSource {
    /// Descriptor file on disk.
    File {
        /// Location of the descriptor.
        path: PathBuf,
    },
    /// Magnet URI resolved by the engine.
    Magnet {
        /// Magnet URI to resolve and add.
        uri: String,
    },
    /// Raw descriptor bytes.
    Bytes {
        /// Encoded descriptor payload.
        bytes: Vec<u8>,
    },
}

impl TorrentSource {
    /// Convenience constructor for magnet-based sources.
    #[must_use]
    pub fn magnet(uri: impl Into<String>) -> Self {
        Self::Magnet { uri: uri.into() }
    }

    /// Convenience constructor for file-based sources.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    /// `true` when the source is a magnet URI.
    #[must_use]
    pub const fn is_magnet(&self) -> bool {
        matches!(self, Self::Magnet { .. })
    }
}

/// Per-file download priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    Ignore,
    Low,
    #[default]
    Default,
    High,
}

/// Transient request payload for adding a task. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTorrentParams {
    /// Descriptor source.
    pub source: TorrentSource,
    /// Content hash the add is expected to produce.
    pub id: InfoHash,
    /// Display name.
    pub name: String,
    /// Destination directory.
    pub download_path: PathBuf,
    /// Initial per-file priorities; empty means engine defaults.
    #[serde(default)]
    pub file_priorities: Vec<FilePriority>,
    /// Download pieces in order.
    #[serde(default)]
    pub sequential_download: bool,
    /// Start transferring immediately after the add.
    #[serde(default = "default_true")]
    pub start_after_add: bool,
    /// Skip the free-space check.
    #[serde(default)]
    pub ignore_free_space: bool,
    /// Prioritise the first and last pieces of each file.
    #[serde(default)]
    pub first_last_piece_priority: bool,
    /// Open a stream for the first media file as soon as the task is added.
    #[serde(default)]
    pub stream_on_add: bool,
}

const fn default_true() -> bool {
    true
}

impl AddTorrentParams {
    /// Params with the default flags for `source`.
    #[must_use]
    pub fn new(
        source: TorrentSource,
        id: InfoHash,
        name: impl Into<String>,
        download_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            id,
            name: name.into(),
            download_path: download_path.into(),
            file_priorities: Vec::new(),
            sequential_download: false,
            start_after_add: true,
            ignore_free_space: false,
            first_last_piece_priority: false,
            stream_on_add: false,
        }
    }
}

/// Lightweight result of parsing a magnet URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagnetInfo {
    /// Original URI.
    pub uri: String,
    /// Content hash.
    pub hash: InfoHash,
    /// Advisory display name (`dn`).
    pub name: Option<String>,
    /// Advisory trackers (`tr`).
    pub trackers: Vec<String>,
    /// Advisory web seeds (`ws`).
    pub web_seeds: Vec<String>,
}

/// File entry inside resolved metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    /// Relative path inside the payload.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl MetaFile {
    /// Whether the file looks like playable audio or video.
    #[must_use]
    pub fn is_media(&self) -> bool {
        is_media_path(&self.path)
    }
}

/// Extensions treated as playable media, lowercase.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "3gp", "aac", "avi", "flac", "flv", "m2ts", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "mpeg",
    "mpg", "ogg", "ogv", "opus", "ts", "wav", "webm", "wmv",
];

/// Whether `path` carries one of [`MEDIA_EXTENSIONS`], ignoring case.
#[must_use]
pub fn is_media_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Playable file inside a live task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    /// Owning task.
    pub torrent_id: InfoHash,
    /// Index in payload order.
    pub index: usize,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Fully present on disk.
    pub downloaded: bool,
}

/// Where a media file can be played from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum PlaybackTarget {
    /// Downloaded file on local disk.
    File(PathBuf),
    /// URL on the streaming endpoint.
    Stream(String),
}

/// Decoded task metadata. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentMetaInfo {
    /// Payload name.
    pub name: String,
    /// Content hash.
    pub hash: InfoHash,
    /// Files in payload order.
    pub files: Vec<MetaFile>,
    /// Piece length in bytes.
    pub piece_length: u64,
    /// Number of pieces.
    pub num_pieces: u64,
    /// Announce URLs listed in the descriptor.
    #[serde(default)]
    pub trackers: Vec<String>,
}

impl TorrentMetaInfo {
    /// Sum of all file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Peer connection encryption policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptMode {
    Disabled,
    #[default]
    Enabled,
    Forced,
}

/// Proxy flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    #[default]
    None,
    Socks4,
    Socks5,
    Http,
}

/// Proxy configuration pushed into the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Proxy flavour.
    pub kind: ProxyKind,
    /// Proxy host.
    pub address: String,
    /// Proxy port.
    pub port: u16,
    /// Route peer connections through the proxy as well.
    pub proxy_peers: bool,
    /// Credentials when the proxy requires authentication.
    pub login: Option<String>,
    /// Password paired with `login`.
    pub password: Option<String>,
}

/// Inclusive listen port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub first: u16,
    /// Last port.
    pub second: u16,
}

impl PortRange {
    /// Range used when random ports are disabled.
    pub const DEFAULT: Self = Self {
        first: 6881,
        second: 6889,
    };
}

impl Default for PortRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Engine-level configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Encryption policy.
    pub encrypt_mode: EncryptMode,
    /// Listen port range.
    pub port_range: PortRange,
    /// Pick a random listen port on start.
    pub use_random_port: bool,
    /// Proxy configuration.
    pub proxy: ProxySettings,
    /// Global download limit in bytes per second; `None` is unlimited.
    pub download_rate_limit: Option<u64>,
    /// Global upload limit in bytes per second; `None` is unlimited.
    pub upload_rate_limit: Option<u64>,
    /// Maximum concurrently active tasks.
    pub max_active_downloads: u32,
    /// Enable the distributed hash table.
    pub dht_enabled: bool,
    /// Enable local service discovery.
    pub lsd_enabled: bool,
    /// Enable UPnP / NAT-PMP port mapping.
    pub port_mapping_enabled: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            encrypt_mode: EncryptMode::default(),
            port_range: PortRange::DEFAULT,
            use_random_port: true,
            proxy: ProxySettings::default(),
            download_rate_limit: None,
            upload_rate_limit: None,
            max_active_downloads: 4,
            dht_enabled: true,
            lsd_enabled: true,
            port_mapping_enabled: true,
        }
    }
}

/// Live engine-side state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Unknown,
    FetchingMetadata,
    Checking,
    Downloading,
    Seeding,
    Finished,
    Paused,
    Error,
}

/// Point-in-time engine status of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Engine state.
    pub state: TaskState,
    /// Completion in `[0, 1]`.
    pub progress: f32,
    /// Bytes received.
    pub bytes_downloaded: u64,
    /// Bytes sent.
    pub bytes_uploaded: u64,
    /// Current download rate.
    pub download_rate: u64,
    /// Current upload rate.
    pub upload_rate: u64,
    /// Connected peers.
    pub peers: u32,
}

/// Per-task rate limits; `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedLimits {
    /// Download limit in bytes per second.
    pub download: Option<u64>,
    /// Upload limit in bytes per second.
    pub upload: Option<u64>,
}

/// Store record merged with live engine status for list views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentInfo {
    /// Content hash.
    pub id: InfoHash,
    /// Display name.
    pub name: String,
    /// Destination directory.
    pub download_path: PathBuf,
    /// When the task was added.
    pub date_added: DateTime<Utc>,
    /// Stored error message.
    pub error: Option<String>,
    /// List visibility.
    pub visibility: Visibility,
    /// Live status, absent when the engine does not know the task.
    pub status: Option<TaskStatus>,
    /// Sequential download flag.
    pub sequential: bool,
    /// First/last piece priority flag.
    pub first_last_piece_priority: bool,
    /// File priorities as the engine reports them.
    pub file_priorities: Vec<FilePriority>,
}

/// Tracker set update applied to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrackersUpdate {
    /// Append to the existing set.
    Add {
        /// URLs to add.
        urls: BTreeSet<String>,
    },
    /// Replace the existing set.
    Replace {
        /// Complete new set.
        urls: BTreeSet<String>,
    },
    /// Remove from the existing set.
    Remove {
        /// URLs to drop.
        urls: BTreeSet<String>,
    },
}
