//! Observable settings source.
//!
//! # Design
//! - `SettingsStore` keeps the current document in a `watch` channel so
//!   readers get cheap snapshots and observers see every accepted change.
//! - Updates are validated before they are published; a rejected update
//!   leaves the current document untouched.

use tokio::sync::watch;
use tracing::info;

use crate::error::ConfigResult;
use crate::model::EngineSettings;
use crate::validate::validate;

/// Typed, observable settings source read by the session controller.
pub trait SettingsSource: Send + Sync {
    /// Current settings.
    fn snapshot(&self) -> EngineSettings;
    /// Observe settings changes.
    fn subscribe(&self) -> watch::Receiver<EngineSettings>;
}

/// In-process settings source backed by a `watch` channel.
#[derive(Debug)]
pub struct SettingsStore {
    sender: watch::Sender<EngineSettings>,
}

impl SettingsStore {
    /// Seed the store with an already validated document.
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        let (sender, _) = watch::channel(settings);
        Self { sender }
    }

    /// Apply `change` to a copy of the current settings and publish it.
    ///
    /// # Errors
    ///
    /// Returns the validation failure when the edited document is invalid.
    pub fn update<F>(&self, change: F) -> ConfigResult<EngineSettings>
    where
        F: FnOnce(&mut EngineSettings),
    {
        let mut candidate = self.sender.borrow().clone();
        change(&mut candidate);
        validate(&candidate)?;
        self.sender.send_replace(candidate.clone());
        info!("settings updated");
        Ok(candidate)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl SettingsSource for SettingsStore {
    fn snapshot(&self) -> EngineSettings {
        self.sender.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<EngineSettings> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn updates_are_observable() -> anyhow::Result<()> {
        let store = SettingsStore::default();
        let mut rx = store.subscribe();
        store.update(|settings| settings.shutdown_downloads_complete = true)?;

        timeout(Duration::from_secs(1), rx.changed()).await??;
        assert!(rx.borrow().shutdown_downloads_complete);
        assert!(store.snapshot().shutdown_downloads_complete);
        Ok(())
    }

    #[test]
    fn invalid_updates_are_rejected() {
        let store = SettingsStore::default();
        let result = store.update(|settings| settings.watch_dir.enabled = true);
        assert!(result.is_err());
        assert!(!store.snapshot().watch_dir.enabled);
    }
}
