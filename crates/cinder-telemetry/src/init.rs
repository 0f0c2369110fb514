//! Logger installation for the daemon.
//!
//! # Design
//! - One entry point installs a global `tracing` subscriber in JSON, pretty or
//!   compact form.
//! - `RUST_LOG` wins when set. Otherwise the configured level applies to
//!   cinder crates and chatty dependencies are capped at `warn`.
//! - The build SHA is recorded once and stamped onto the daemon root span.

use once_cell::sync::OnceCell;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TelemetryError};

/// Level used when the settings document does not name one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Dependencies whose logs are capped unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &[&str] = &["notify=warn", "hyper=warn", "axum=warn", "mio=warn"];

static BUILD_SHA: OnceCell<String> = OnceCell::new();

/// Logger settings taken from the settings document.
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Level or filter directive, e.g. `debug` or `cinder_session=trace`.
    pub level: &'a str,
    /// Output format.
    pub format: LogFormat,
    /// Build identifier stamped onto the root span.
    pub build_sha: &'a str,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: LogFormat::infer(),
            build_sha: build_sha(),
        }
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

impl LogFormat {
    /// Pretty output for debug builds, JSON for release builds.
    #[must_use]
    pub const fn infer() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }

    /// Parse a configured format name (case-insensitive), falling back to
    /// [`LogFormat::infer`].
    #[must_use]
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|name| name.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => Self::Json,
            Some("pretty") => Self::Pretty,
            Some("compact") => Self::Compact,
            _ => Self::infer(),
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] for an unparsable level and
/// [`TelemetryError::SubscriberInstall`] when a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(config.level)?;
    let _ = BUILD_SHA.set(config.build_sha.to_string());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty().with_target(false)).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };
    installed.map_err(|source| TelemetryError::SubscriberInstall { source })
}

/// Build SHA recorded by [`init_logging`], or `dev` before initialisation.
#[must_use]
pub fn build_sha() -> &'static str {
    BUILD_SHA.get().map_or("dev", String::as_str)
}

/// Span wrapping the daemon's lifetime.
#[must_use]
pub fn daemon_span() -> Span {
    tracing::info_span!("cinder", build_sha = %build_sha())
}

fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = filter_directive(level);
    EnvFilter::try_new(&directive)
        .map_err(|source| TelemetryError::InvalidFilter { directive, source })
}

fn filter_directive(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { DEFAULT_LOG_LEVEL } else { level };
    let mut directive = level.to_string();
    for quiet in QUIET_DEPENDENCIES {
        directive.push(',');
        directive.push_str(quiet);
    }
    directive
}
