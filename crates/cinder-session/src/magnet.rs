//! Magnet metadata resolution with per-hash deduplication.
//!
//! # Design
//! - One engine fetch per hash: the first caller registers a hash-filtered
//!   listener on the metadata category and starts the fetch, later callers
//!   attach to the same pending entry.
//! - Outcomes are published through a `watch` channel so every caller observes
//!   the same value, no matter when it started waiting.
//! - The fetch start runs on its own task, so dropping the first caller
//!   never leaves waiters attached to a fetch that was never started.
//! - Completion is exchange-once. Whoever flips `done` first removes the
//!   listener and records the outcome; every later completion is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cinder_events::{Event, EventCategory, ListenerBus, ListenerHandle};
use cinder_torrent_core::{
    InfoHash, MagnetInfo, TorrentError, TorrentMetaInfo, TransferEngine, parse_magnet,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};

/// Outcome shared by every caller waiting on a hash.
pub type FetchOutcome = Result<Arc<TorrentMetaInfo>, FetchError>;

/// Reasons a metadata fetch can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The delivered payload could not be decoded.
    #[error("magnet metadata could not be decoded")]
    Decode {
        /// Decoder message.
        reason: String,
    },
    /// The engine finished the fetch without a payload.
    #[error("magnet metadata payload missing")]
    MissingPayload,
    /// The fetch was cancelled before it resolved.
    #[error("magnet metadata fetch cancelled")]
    Cancelled,
    /// The engine refused to start the fetch.
    #[error("magnet metadata fetch failed")]
    Engine {
        /// Engine message.
        reason: String,
    },
}

struct PendingFetch {
    hash: InfoHash,
    done: AtomicBool,
    listener: Mutex<Option<ListenerHandle>>,
    outcome: tokio::sync::watch::Sender<Option<FetchOutcome>>,
}

impl PendingFetch {
    fn new(hash: InfoHash) -> Self {
        let (outcome, _) = tokio::sync::watch::channel(None);
        Self {
            hash,
            done: AtomicBool::new(false),
            listener: Mutex::new(None),
            outcome,
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the listener handle, or drop it right away when the fetch already
    /// completed while it was being registered.
    fn set_listener(&self, bus: &ListenerBus, handle: ListenerHandle) {
        let mut slot = self.lock_listener();
        if self.is_done() {
            drop(slot);
            bus.unregister(handle);
        } else {
            *slot = Some(handle);
        }
    }
}

struct Inner {
    engine: Arc<dyn TransferEngine>,
    bus: ListenerBus,
    pending: Mutex<HashMap<InfoHash, Arc<PendingFetch>>>,
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<InfoHash, Arc<PendingFetch>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode(&self, bytes: &[u8]) -> FetchOutcome {
        self.engine
            .decode_metadata(bytes)
            .map(Arc::new)
            .map_err(|err| FetchError::Decode {
                reason: match err {
                    TorrentError::DecodeFailure { reason } => reason,
                    other => other.to_string(),
                },
            })
    }

    /// Record `outcome` once. Returns `false` when the fetch already completed.
    fn finish(&self, fetch: &Arc<PendingFetch>, outcome: FetchOutcome) -> bool {
        if fetch.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = fetch.lock_listener().take() {
            self.bus.unregister(handle);
        }

        match &outcome {
            Ok(meta) => info!(hash = %fetch.hash, name = %meta.name, "magnet metadata resolved"),
            Err(err) => warn!(hash = %fetch.hash, error = %err, "magnet metadata unresolved"),
        }
        fetch.outcome.send_replace(Some(outcome));

        let mut pending = self.lock_pending();
        if pending
            .get(&fetch.hash)
            .is_some_and(|current| Arc::ptr_eq(current, fetch))
        {
            pending.remove(&fetch.hash);
        }
        true
    }
}

/// Deduplicating front for magnet metadata fetches.
#[derive(Clone)]
pub struct MagnetCoordinator {
    inner: Arc<Inner>,
}

impl MagnetCoordinator {
    /// Build a coordinator listening for metadata on `bus`.
    #[must_use]
    pub fn new(engine: Arc<dyn TransferEngine>, bus: ListenerBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                bus,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Parse `uri` and attach to (or start) the metadata fetch for its hash.
    ///
    /// # Errors
    ///
    /// Returns a decode failure when `uri` is not a usable magnet URI. Engine
    /// failures are reported through the returned [`PendingMetadata`].
    pub async fn resolve(&self, uri: &str) -> SessionResult<(MagnetInfo, PendingMetadata)> {
        let magnet = parse_magnet(uri).map_err(|err| SessionError::torrent("resolve_magnet", err))?;

        let (fetch, first) = {
            let mut pending = self.inner.lock_pending();
            match pending.get(&magnet.hash) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let fetch = Arc::new(PendingFetch::new(magnet.hash.clone()));
                    pending.insert(magnet.hash.clone(), Arc::clone(&fetch));
                    (fetch, true)
                }
            }
        };

        if first {
            // Spawned so a caller dropped mid-start cannot strand the entry.
            let coordinator = self.clone();
            let starting = Arc::clone(&fetch);
            let request = magnet.clone();
            let started =
                tokio::spawn(async move { coordinator.begin(&starting, &request).await });
            if let Err(err) = started.await {
                self.inner.finish(
                    &fetch,
                    Err(FetchError::Engine {
                        reason: err.to_string(),
                    }),
                );
            }
        } else {
            debug!(hash = %magnet.hash, "joining in-flight magnet fetch");
        }

        let pending = PendingMetadata {
            receiver: fetch.outcome.subscribe(),
            fetch,
            coordinator: self.clone(),
        };
        Ok((magnet, pending))
    }

    async fn begin(&self, fetch: &Arc<PendingFetch>, magnet: &MagnetInfo) {
        if let Some(bytes) = self.inner.engine.cached_metadata(&fetch.hash) {
            debug!(hash = %fetch.hash, "magnet metadata served from engine cache");
            let outcome = self.inner.decode(&bytes);
            self.inner.finish(fetch, outcome);
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let target: Weak<PendingFetch> = Arc::downgrade(fetch);
        let watched = fetch.hash.clone();
        let handle = self
            .inner
            .bus
            .register(EventCategory::MetadataLoaded, move |event| {
                let Event::MagnetMetadata { hash, payload } = event else {
                    return;
                };
                if *hash != watched {
                    return;
                }
                let (Some(inner), Some(fetch)) = (inner.upgrade(), target.upgrade()) else {
                    return;
                };
                let outcome = payload
                    .as_deref()
                    .map_or(Err(FetchError::MissingPayload), |bytes| inner.decode(bytes));
                inner.finish(&fetch, outcome);
            });
        fetch.set_listener(&self.inner.bus, handle);

        if fetch.is_done() {
            return;
        }
        if let Err(err) = self.inner.engine.fetch_metadata(magnet).await {
            self.inner.finish(
                fetch,
                Err(FetchError::Engine {
                    reason: err.to_string(),
                }),
            );
        }
    }

    /// Abandon the fetch for `hash`.
    ///
    /// Has no effect when `hash` is already a full task or the fetch already
    /// resolved. Returns `true` when a pending fetch was cancelled.
    pub async fn cancel(&self, hash: &InfoHash) -> bool {
        if self.inner.engine.task(hash).is_some() {
            debug!(hash = %hash, "magnet already added as a task; cancel ignored");
            return false;
        }
        let fetch = self.inner.lock_pending().get(hash).cloned();
        let Some(fetch) = fetch else {
            return false;
        };
        if !self.inner.finish(&fetch, Err(FetchError::Cancelled)) {
            return false;
        }
        if let Err(err) = self.inner.engine.cancel_fetch(hash).await {
            warn!(hash = %hash, error = %err, "engine refused to cancel metadata fetch");
        }
        true
    }

    /// Cancel every pending fetch. Returns the number cancelled.
    pub async fn cancel_all(&self) -> usize {
        let fetches: Vec<_> = self.inner.lock_pending().values().cloned().collect();
        let mut cancelled = 0;
        for fetch in fetches {
            if !self.inner.finish(&fetch, Err(FetchError::Cancelled)) {
                continue;
            }
            cancelled += 1;
            if let Err(err) = self.inner.engine.cancel_fetch(&fetch.hash).await {
                debug!(hash = %fetch.hash, error = %err, "metadata fetch cancel skipped");
            }
        }
        cancelled
    }

    /// Number of unresolved fetches.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }
}

/// Caller-side handle on a metadata fetch.
pub struct PendingMetadata {
    fetch: Arc<PendingFetch>,
    receiver: tokio::sync::watch::Receiver<Option<FetchOutcome>>,
    coordinator: MagnetCoordinator,
}

impl PendingMetadata {
    /// Hash being resolved.
    #[must_use]
    pub fn hash(&self) -> &InfoHash {
        &self.fetch.hash
    }

    /// Wait for the fetch to resolve, fail or be cancelled.
    pub async fn wait(&mut self) -> FetchOutcome {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(FetchError::Cancelled)),
            Err(_) => Err(FetchError::Cancelled),
        }
    }

    /// Outcome if the fetch already completed.
    #[must_use]
    pub fn try_result(&self) -> Option<FetchOutcome> {
        self.receiver.borrow().clone()
    }

    /// Cancel the shared fetch for every waiter.
    pub async fn cancel(&self) -> bool {
        self.coordinator.cancel(&self.fetch.hash).await
    }
}

impl std::fmt::Debug for PendingMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMetadata")
            .field("hash", &self.fetch.hash)
            .field("done", &self.fetch.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_test_support::fixtures;
    use cinder_torrent_loopback::LoopbackEngine;
    use std::time::Duration;
    use tokio::time::timeout;

    fn coordinator() -> (Arc<LoopbackEngine>, ListenerBus, MagnetCoordinator) {
        let bus = ListenerBus::new();
        let engine = Arc::new(LoopbackEngine::in_memory());
        engine.attach(bus.clone());
        let coordinator = MagnetCoordinator::new(engine.clone(), bus.clone());
        (engine, bus, coordinator)
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_fetch() -> anyhow::Result<()> {
        let (engine, bus, coordinator) = coordinator();
        let hash = fixtures::info_hash(1);
        let uri = fixtures::magnet_uri(&hash, "shared");

        let mut waiters = Vec::new();
        for _ in 0..6 {
            let coordinator = coordinator.clone();
            let uri = uri.clone();
            waiters.push(tokio::spawn(async move {
                let (_, mut pending) = coordinator.resolve(&uri).await?;
                Ok::<_, SessionError>(pending.wait().await)
            }));
        }
        timeout(Duration::from_secs(1), async {
            while engine.fetch_count(&hash) == 0 || coordinator.pending_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        // Let every spawned caller attach before metadata lands.
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.deliver_metadata(&hash, Some(fixtures::metainfo_json(&hash, "shared")));

        for waiter in waiters {
            let meta = waiter.await??.map_err(anyhow::Error::msg)?;
            assert_eq!(meta.name, "shared");
        }
        assert_eq!(engine.fetch_count(&hash), 1);
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(bus.listener_count(EventCategory::MetadataLoaded), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cached_metadata_resolves_without_fetching() -> anyhow::Result<()> {
        let (engine, _, coordinator) = coordinator();
        let hash = fixtures::info_hash(2);
        engine.seed_metadata(&hash, fixtures::metainfo_json(&hash, "cached"));

        let (info, pending) = coordinator
            .resolve(&fixtures::magnet_uri(&hash, "cached"))
            .await?;
        assert_eq!(info.hash, hash);
        let outcome = pending.try_result().expect("resolved immediately");
        assert_eq!(outcome.map_err(anyhow::Error::msg)?.name, "cached");
        assert_eq!(engine.fetch_count(&hash), 0);
        Ok(())
    }

    #[tokio::test]
    async fn decode_failure_and_missing_payload_reach_waiters() -> anyhow::Result<()> {
        let (engine, _, coordinator) = coordinator();
        let broken = fixtures::info_hash(3);
        let empty = fixtures::info_hash(4);

        let (_, mut first) = coordinator
            .resolve(&fixtures::magnet_uri(&broken, "broken"))
            .await?;
        let (_, mut second) = coordinator
            .resolve(&fixtures::magnet_uri(&broken, "broken"))
            .await?;
        engine.deliver_metadata(&broken, Some(b"not a descriptor".to_vec()));
        let first = first.wait().await;
        assert!(matches!(first, Err(FetchError::Decode { .. })));
        assert_eq!(first, second.wait().await);

        let (_, mut none) = coordinator
            .resolve(&fixtures::magnet_uri(&empty, "empty"))
            .await?;
        engine.deliver_metadata(&empty, None);
        assert_eq!(none.wait().await, Err(FetchError::MissingPayload));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_fails_waiters_once() -> anyhow::Result<()> {
        let (engine, bus, coordinator) = coordinator();
        let hash = fixtures::info_hash(5);

        let (_, mut pending) = coordinator
            .resolve(&fixtures::magnet_uri(&hash, "cancelled"))
            .await?;
        assert!(pending.cancel().await);
        assert_eq!(pending.wait().await, Err(FetchError::Cancelled));
        assert!(!coordinator.cancel(&hash).await);
        assert_eq!(engine.cancelled_fetches(), vec![hash.clone()]);
        assert_eq!(bus.listener_count(EventCategory::MetadataLoaded), 0);

        // A late delivery after cancellation changes nothing.
        engine.deliver_metadata(&hash, Some(fixtures::metainfo_json(&hash, "late")));
        assert_eq!(pending.try_result(), Some(Err(FetchError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_after_resolution_has_no_effect() -> anyhow::Result<()> {
        let (engine, _, coordinator) = coordinator();
        let hash = fixtures::info_hash(6);
        let (_, mut pending) = coordinator
            .resolve(&fixtures::magnet_uri(&hash, "done"))
            .await?;
        engine.deliver_metadata(&hash, Some(fixtures::metainfo_json(&hash, "done")));
        assert!(pending.wait().await.is_ok());

        assert!(!pending.cancel().await);
        assert!(pending.try_result().is_some_and(|outcome| outcome.is_ok()));
        assert!(engine.cancelled_fetches().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_first_caller_still_starts_the_fetch() -> anyhow::Result<()> {
        let (engine, _, coordinator) = coordinator();
        let hash = fixtures::info_hash(7);
        let uri = fixtures::magnet_uri(&hash, "abandoned");

        // Polled once, then dropped while the fetch start is still queued.
        let abandoned = timeout(Duration::ZERO, coordinator.resolve(&uri)).await;
        assert!(abandoned.is_err());

        let (_, mut pending) = coordinator.resolve(&uri).await?;
        timeout(Duration::from_secs(1), async {
            while engine.fetch_count(&hash) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        engine.deliver_metadata(&hash, Some(fixtures::metainfo_json(&hash, "abandoned")));
        let meta = timeout(Duration::from_secs(1), pending.wait())
            .await?
            .map_err(anyhow::Error::msg)?;
        assert_eq!(meta.name, "abandoned");
        assert_eq!(engine.fetch_count(&hash), 1);
        assert_eq!(coordinator.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_uri_is_rejected_synchronously() {
        let (_, _, coordinator) = coordinator();
        let err = coordinator
            .resolve("magnet:?dn=no-topic")
            .await
            .expect_err("missing topic");
        assert!(matches!(
            err.torrent_error(),
            Some(TorrentError::DecodeFailure { .. })
        ));
        assert_eq!(coordinator.pending_count(), 0);
    }
}
