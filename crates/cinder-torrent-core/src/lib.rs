#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! Engine-agnostic task interfaces and DTOs.
//!
//! Layout: `model/` (task records, add requests, settings, status),
//! `service/` (collaborator traits), `magnet.rs` (URI parsing and locator
//! classification), `error.rs` (error taxonomy).

pub mod error;
pub mod magnet;
pub mod model;
pub mod service;

pub use cinder_events::InfoHash;
pub use error::{TorrentError, TorrentResult};
pub use magnet::{Locator, is_valid_tracker_url, normalize_magnet_hash, parse_magnet};
pub use model::{
    AddTorrentParams, EncryptMode, FilePriority, MEDIA_EXTENSIONS, MagnetInfo, MediaFile,
    MetaFile, PlaybackTarget, PortRange, ProxyKind, ProxySettings, SessionSettings, SpeedLimits,
    TaskState, TaskStatus, Torrent, TorrentInfo, TorrentMetaInfo, TorrentSource, TrackersUpdate,
    Visibility, is_media_path,
};
pub use service::{
    CompletionSignal, EnvironmentProbe, EnvironmentReadings, FileSystemFacade, StaticEnvironment,
    StreamingEndpoint, TaskHandle, TorrentRepository, TransferEngine, stream_url,
};
