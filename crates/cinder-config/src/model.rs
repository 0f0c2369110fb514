//! Typed settings model.
//!
//! # Design
//! - One document groups every section the session layer reads; each section
//!   deserialises with defaults so partial documents are valid.
//! - Engine-facing values live in [`SessionSettings`] and are pushed into the
//!   engine verbatim; the rest steer the session controller.

use std::path::PathBuf;

use cinder_torrent_core::SessionSettings;
use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_CUSTOM_BATTERY_THRESHOLD, DEFAULT_LOG_LEVEL, DEFAULT_STREAMING_HOST,
    DEFAULT_STREAMING_PORT,
};

/// Complete settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Values pushed into the engine.
    pub session: SessionSettings,
    /// IP filter rule loading.
    pub ip_filter: IpFilterSettings,
    /// Directory ingestion.
    pub watch_dir: WatchDirSettings,
    /// Local streaming endpoint.
    pub streaming: StreamingSettings,
    /// Power and network scheduling policy.
    pub scheduling: SchedulingPolicy,
    /// Download locations.
    pub storage: StorageSettings,
    /// Stop the session once every download completes.
    pub shutdown_downloads_complete: bool,
    /// Log output.
    pub logging: LoggingSettings,
}

/// IP filter rule loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpFilterSettings {
    /// Load the rule file on session start.
    pub enabled: bool,
    /// Rule file location.
    pub file: Option<PathBuf>,
}

/// Directory ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchDirSettings {
    /// Watch the directory while the session runs.
    pub enabled: bool,
    /// Directory to scan and watch.
    pub dir: Option<PathBuf>,
    /// Delete descriptor files once their add succeeded.
    pub delete_file: bool,
}

/// Local streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Serve payload files over HTTP while the session runs.
    pub enabled: bool,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_STREAMING_HOST.to_string(),
            port: DEFAULT_STREAMING_PORT,
        }
    }
}

/// Power and network conditions under which transfers pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingPolicy {
    /// Pause below the platform low-battery level.
    pub battery_control: bool,
    /// Use `custom_battery_threshold` instead of the platform level.
    pub custom_battery_control: bool,
    /// Custom low-battery threshold in percent.
    pub custom_battery_threshold: u8,
    /// Pause unless external power is attached.
    pub only_when_charging: bool,
    /// Pause on metered networks.
    pub unmetered_only: bool,
    /// Pause while the active network is roaming.
    pub respect_roaming: bool,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            battery_control: false,
            custom_battery_control: false,
            custom_battery_threshold: DEFAULT_CUSTOM_BATTERY_THRESHOLD,
            only_when_charging: false,
            unmetered_only: false,
            respect_roaming: false,
        }
    }
}

/// Download locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Default destination; the platform download directory when unset.
    pub download_dir: Option<PathBuf>,
    /// Move finished payloads to `move_after_download_dir`.
    pub move_after_download: bool,
    /// Destination for finished payloads.
    pub move_after_download_dir: Option<PathBuf>,
    /// Scratch directory cleaned on stop.
    pub temp_dir: Option<PathBuf>,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// `json` or `pretty`; inferred from the build when unset.
    pub format: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: None,
        }
    }
}
