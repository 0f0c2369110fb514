//! Validation helpers for settings documents.

use crate::error::{ConfigError, ConfigResult};
use crate::model::EngineSettings;

const MAX_PERCENT: u8 = 100;

/// Check cross-field constraints the serde model cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] naming the first offending field.
pub fn validate(settings: &EngineSettings) -> ConfigResult<()> {
    let range = settings.session.port_range;
    if range.first == 0 || range.second == 0 {
        return Err(ConfigError::invalid(
            "session",
            "port_range",
            Some(format!("{}-{}", range.first, range.second)),
            "ports must be non-zero",
        ));
    }
    if range.first > range.second {
        return Err(ConfigError::invalid(
            "session",
            "port_range",
            Some(format!("{}-{}", range.first, range.second)),
            "first port must not exceed second port",
        ));
    }

    if settings.ip_filter.enabled && settings.ip_filter.file.is_none() {
        return Err(ConfigError::invalid(
            "ip_filter",
            "file",
            None,
            "required when ip filtering is enabled",
        ));
    }

    if settings.watch_dir.enabled && settings.watch_dir.dir.is_none() {
        return Err(ConfigError::invalid(
            "watch_dir",
            "dir",
            None,
            "required when directory watching is enabled",
        ));
    }

    if settings.streaming.enabled {
        if settings.streaming.host.trim().is_empty() {
            return Err(ConfigError::invalid(
                "streaming",
                "host",
                None,
                "must not be empty",
            ));
        }
        if settings.streaming.port == 0 {
            return Err(ConfigError::invalid(
                "streaming",
                "port",
                Some("0".to_string()),
                "must be non-zero",
            ));
        }
    }

    if settings.scheduling.custom_battery_threshold > MAX_PERCENT {
        return Err(ConfigError::invalid(
            "scheduling",
            "custom_battery_threshold",
            Some(settings.scheduling.custom_battery_threshold.to_string()),
            "must be a percentage",
        ));
    }

    if settings.storage.move_after_download && settings.storage.move_after_download_dir.is_none() {
        return Err(ConfigError::invalid(
            "storage",
            "move_after_download_dir",
            None,
            "required when move after download is enabled",
        ));
    }

    if let Some(format) = settings.logging.format.as_deref() {
        if !matches!(format, "json" | "pretty") {
            return Err(ConfigError::invalid(
                "logging",
                "format",
                Some(format.to_string()),
                "must be json or pretty",
            ));
        }
    }

    Ok(())
}
