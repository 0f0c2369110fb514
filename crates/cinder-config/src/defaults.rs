//! Default values shared by the settings model and loader.

/// Filter directive used when neither the document nor `RUST_LOG` set one.
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Streaming endpoint bind host.
pub const DEFAULT_STREAMING_HOST: &str = "127.0.0.1";
/// Streaming endpoint bind port.
pub const DEFAULT_STREAMING_PORT: u16 = 8800;
/// Custom low-battery threshold in percent.
pub const DEFAULT_CUSTOM_BATTERY_THRESHOLD: u8 = 15;
/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "CINDER_";
