//! Fires when the last active download finishes.

use std::sync::{Arc, Weak};

use cinder_events::{EventCategory, ListenerBus, ListenerHandle};
use cinder_torrent_core::{CompletionSignal, TransferEngine};
use tokio::sync::broadcast;
use tracing::debug;

/// Bus-driven [`CompletionSignal`] that checks the engine's active download
/// count every time a task finishes.
pub struct DownloadsCompleted {
    bus: ListenerBus,
    handle: ListenerHandle,
    sender: broadcast::Sender<()>,
}

impl DownloadsCompleted {
    /// Start listening for finished tasks on `bus`.
    #[must_use]
    pub fn new(engine: &Arc<dyn TransferEngine>, bus: ListenerBus) -> Self {
        let (sender, _) = broadcast::channel(4);
        let engine: Weak<dyn TransferEngine> = Arc::downgrade(engine);
        let notify = sender.clone();
        let handle = bus.register(EventCategory::TaskFinished, move |event| {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let remaining = engine.active_downloads();
            debug!(task = ?event.task_id(), remaining, "task finished");
            if remaining == 0 {
                let _ = notify.send(());
            }
        });
        Self {
            bus,
            handle,
            sender,
        }
    }
}

impl CompletionSignal for DownloadsCompleted {
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Drop for DownloadsCompleted {
    fn drop(&mut self) {
        self.bus.unregister(self.handle);
    }
}
