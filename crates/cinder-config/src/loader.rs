//! Settings document loading with environment overrides.
//!
//! # Design
//! - A missing document path yields defaults; a present but unreadable or
//!   malformed document is an error.
//! - `CINDER_*` variables override individual fields after the document is
//!   parsed, then the merged result is validated once.
//! - Variable lookup is injected so tests never touch the process environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::EngineSettings;
use crate::validate::validate;

/// Variable naming the settings document.
pub const CONFIG_PATH_ENV: &str = "CINDER_CONFIG";

const DOWNLOAD_DIR_ENV: &str = "CINDER_DOWNLOAD_DIR";
const WATCH_DIR_ENV: &str = "CINDER_WATCH_DIR";
const STREAMING_HOST_ENV: &str = "CINDER_STREAMING_HOST";
const STREAMING_PORT_ENV: &str = "CINDER_STREAMING_PORT";
const LOG_LEVEL_ENV: &str = "CINDER_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "CINDER_LOG_FORMAT";
const SHUTDOWN_ON_COMPLETE_ENV: &str = "CINDER_SHUTDOWN_ON_COMPLETE";

/// Load settings from `path` (when given) and the process environment.
///
/// # Errors
///
/// Returns an error when the document cannot be read or parsed, an override
/// is malformed, or the merged settings fail validation.
pub fn load_settings(path: Option<&Path>) -> ConfigResult<EngineSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings resolving overrides through `lookup`.
///
/// # Errors
///
/// See [`load_settings`].
pub fn load_settings_with<F>(path: Option<&Path>, lookup: F) -> ConfigResult<EngineSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match path {
        Some(path) => read_document(path)?,
        None => EngineSettings::default(),
    };
    apply_env_overrides(&mut settings, &lookup)?;
    validate(&settings)?;
    Ok(settings)
}

fn read_document(path: &Path) -> ConfigResult<EngineSettings> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
        operation: "settings.read",
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded settings document");
    serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides<F>(settings: &mut EngineSettings, lookup: &F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(DOWNLOAD_DIR_ENV) {
        settings.storage.download_dir = Some(PathBuf::from(dir));
    }
    if let Some(dir) = lookup(WATCH_DIR_ENV) {
        settings.watch_dir.dir = Some(PathBuf::from(dir));
        settings.watch_dir.enabled = true;
    }
    if let Some(host) = lookup(STREAMING_HOST_ENV) {
        settings.streaming.host = host;
    }
    if let Some(port) = parse_env::<u16, _>(lookup, STREAMING_PORT_ENV)? {
        settings.streaming.port = port;
    }
    if let Some(level) = lookup(LOG_LEVEL_ENV) {
        settings.logging.level = level;
    }
    if let Some(format) = lookup(LOG_FORMAT_ENV) {
        settings.logging.format = Some(format);
    }
    if let Some(flag) = parse_env::<bool, _>(lookup, SHUTDOWN_ON_COMPLETE_ENV)? {
        settings.shutdown_downloads_complete = flag;
    }
    Ok(())
}

fn parse_env<T, F>(lookup: &F, name: &'static str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|_| ConfigError::InvalidEnv { name, value })
        })
        .transpose()
}
