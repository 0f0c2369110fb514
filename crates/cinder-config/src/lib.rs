#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]

//! File and environment backed settings for the session layer.
//!
//! Layout: `model.rs` (typed settings document), `defaults.rs` (shared
//! constants), `validate.rs` (cross-field checks), `loader.rs` (JSON document
//! plus `CINDER_*` overrides), `service.rs` (`SettingsSource` +
//! `SettingsStore`).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod service;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, load_settings, load_settings_with};
pub use model::{
    EngineSettings, IpFilterSettings, LoggingSettings, SchedulingPolicy, StorageSettings,
    StreamingSettings, WatchDirSettings,
};
pub use service::{SettingsSource, SettingsStore};
pub use validate::validate;
