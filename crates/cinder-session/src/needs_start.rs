//! Level-triggered "needs start" observation.
//!
//! # Design
//! - Emits once immediately: `true` when the controller is not running,
//!   `false` when it is.
//! - While not running, re-emits `true` on every interval tick. Polling stops
//!   the moment the controller reaches `Running` and picks up again with a
//!   fresh `true` if it later leaves that state.
//! - Cancellation is checked at every wake-up; nothing is emitted after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::controller::LifecycleState;

/// Default polling interval while the controller is not running.
pub const DEFAULT_NEEDS_START_INTERVAL: Duration = Duration::from_secs(1);

const BUFFER: usize = 16;

/// Stream of "the session needs starting" notifications.
#[derive(Debug)]
pub struct NeedsStartObserver {
    receiver: mpsc::Receiver<bool>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl NeedsStartObserver {
    pub(crate) fn spawn(state: watch::Receiver<LifecycleState>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(BUFFER);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll(state, interval, sender, Arc::clone(&cancelled)));
        Self {
            receiver,
            cancelled,
            task,
        }
    }

    /// Next emission, or `None` once cancelled or the controller is gone.
    pub async fn next(&mut self) -> Option<bool> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        let value = self.receiver.recv().await?;
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        Some(value)
    }

    /// Stop polling. Later calls to [`Self::next`] return `None`.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
        self.receiver.close();
    }

    /// `true` once [`Self::cancel`] ran.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for NeedsStartObserver {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }
}

async fn poll(
    mut state: watch::Receiver<LifecycleState>,
    interval: Duration,
    sender: mpsc::Sender<bool>,
    cancelled: Arc<AtomicBool>,
) {
    let emit = |value: bool| {
        if cancelled.load(Ordering::Acquire) {
            return false;
        }
        match sender.try_send(value) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    };

    let running = *state.borrow_and_update() == LifecycleState::Running;
    if !emit(!running) {
        return;
    }

    loop {
        if *state.borrow_and_update() == LifecycleState::Running {
            // Idle until the controller leaves `Running`.
            if state
                .wait_for(|current| *current != LifecycleState::Running)
                .await
                .is_err()
            {
                return;
            }
            if !emit(true) {
                return;
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                reached = state.wait_for(|current| *current == LifecycleState::Running) => {
                    if reached.is_err() {
                        return;
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if !emit(true) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn emits_immediately_and_while_stopped() -> anyhow::Result<()> {
        let (state, receiver) = watch::channel(LifecycleState::Stopped);
        let mut observer = NeedsStartObserver::spawn(receiver, TICK);

        assert_eq!(observer.next().await, Some(true));
        assert_eq!(observer.next().await, Some(true));
        assert_eq!(observer.next().await, Some(true));

        state.send_replace(LifecycleState::Running);
        tokio::task::yield_now().await;
        // Drain a tick that may have raced the transition.
        while let Ok(Some(_)) = timeout(Duration::from_millis(1), observer.next()).await {}
        assert!(
            timeout(TICK * 10, observer.next()).await.is_err(),
            "no emissions while running"
        );

        state.send_replace(LifecycleState::Stopped);
        assert_eq!(observer.next().await, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn running_controller_emits_false_once() {
        let (_state, receiver) = watch::channel(LifecycleState::Running);
        let mut observer = NeedsStartObserver::spawn(receiver, TICK);

        assert_eq!(observer.next().await, Some(false));
        assert!(timeout(TICK * 5, observer.next()).await.is_err());
    }

    #[tokio::test]
    async fn nothing_after_cancel() {
        let (_state, receiver) = watch::channel(LifecycleState::Stopped);
        let mut observer = NeedsStartObserver::spawn(receiver, TICK);
        assert_eq!(observer.next().await, Some(true));

        observer.cancel();
        assert!(observer.is_cancelled());
        assert_eq!(observer.next().await, None);
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(observer.next().await, None);
    }

    #[tokio::test]
    async fn dropped_controller_ends_the_stream() {
        let (state, receiver) = watch::channel(LifecycleState::Running);
        let mut observer = NeedsStartObserver::spawn(receiver, TICK);
        assert_eq!(observer.next().await, Some(false));
        drop(state);
        assert_eq!(observer.next().await, None);
    }
}
