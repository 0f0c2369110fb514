//! Environment scheduling policy.
//!
//! Decides whether transfers should be paused given the configured
//! [`SchedulingPolicy`] and the live [`EnvironmentReadings`]. Conditions are
//! OR-accumulated: roaming, metered link, missing charger, low battery.

use cinder_config::SchedulingPolicy;
use cinder_torrent_core::EnvironmentReadings;

/// Platform low-battery level in percent used when no custom threshold is set.
pub const DEFAULT_LOW_BATTERY_LEVEL: f32 = 15.0;

/// `true` when current conditions call for pausing transfers.
#[must_use]
pub fn should_pause(policy: &SchedulingPolicy, readings: &EnvironmentReadings) -> bool {
    let mut stop = false;

    if policy.respect_roaming {
        stop |= readings.is_roaming;
    }
    if policy.unmetered_only {
        stop |= readings.is_metered;
    }
    if policy.only_when_charging {
        stop |= !readings.is_charging;
    }

    if policy.custom_battery_control {
        stop |= readings.battery_level <= f32::from(policy.custom_battery_threshold);
    } else if policy.battery_control {
        stop |= readings.battery_level <= DEFAULT_LOW_BATTERY_LEVEL;
    }

    stop
}
