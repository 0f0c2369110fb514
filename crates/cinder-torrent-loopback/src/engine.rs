//! In-process [`TransferEngine`] implementation.
//!
//! # Design
//! - All mutable state sits behind one mutex; events are always published
//!   after the lock is released because listeners call back into the engine.
//! - Session start completes asynchronously: `start` returns immediately and
//!   `SessionStarted` is published from a spawned task.
//! - Magnet metadata never arrives on its own. Tests and offline hosts push it
//!   in through [`LoopbackEngine::deliver_metadata`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cinder_events::{Event, ListenerBus};
use cinder_runtime::RuntimeStore;
use cinder_torrent_core::{
    AddTorrentParams, InfoHash, MagnetInfo, SessionSettings, TaskHandle, Torrent, TorrentError,
    TorrentMetaInfo, TorrentRepository, TorrentResult, TorrentSource, TransferEngine,
    parse_magnet,
};
use tracing::{debug, info, warn};

use crate::descriptor;
use crate::task::{LoopbackTask, TaskSeed};

#[derive(Default)]
struct State {
    bus: Option<ListenerBus>,
    settings: SessionSettings,
    tasks: HashMap<InfoHash, Arc<LoopbackTask>>,
    metadata: HashMap<InfoHash, Vec<u8>>,
    fetches: HashMap<InfoHash, usize>,
    cancelled: Vec<InfoHash>,
    broken: HashSet<InfoHash>,
}

/// Transfer engine that keeps every task in memory.
pub struct LoopbackEngine {
    store: Arc<dyn TorrentRepository>,
    state: Mutex<State>,
    running: AtomicBool,
    fail_start: AtomicBool,
}

impl LoopbackEngine {
    /// Engine persisting task records into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TorrentRepository>) -> Self {
        Self {
            store,
            state: Mutex::new(State::default()),
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Engine backed by a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(RuntimeStore::in_memory()))
    }

    /// Store the engine persists into.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TorrentRepository> {
        Arc::clone(&self.store)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bus(&self) -> Option<ListenerBus> {
        self.state().bus.clone()
    }

    /// Publish an event on the attached bus, as if the engine raised it.
    pub fn emit(&self, event: &Event) {
        if let Some(bus) = self.bus() {
            bus.publish(event);
        }
    }

    /// Make the next `start` call fail.
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Make `restore_all` report `id` as unrestorable.
    pub fn fail_restore(&self, id: &InfoHash) {
        self.state().broken.insert(id.clone());
    }

    /// Number of metadata fetches started for `hash`.
    #[must_use]
    pub fn fetch_count(&self, hash: &InfoHash) -> usize {
        self.state().fetches.get(hash).copied().unwrap_or(0)
    }

    /// Hashes whose fetches were cancelled, in cancellation order.
    #[must_use]
    pub fn cancelled_fetches(&self) -> Vec<InfoHash> {
        self.state().cancelled.clone()
    }

    /// Cache metadata for `hash` without announcing it.
    pub fn seed_metadata(&self, hash: &InfoHash, payload: Vec<u8>) {
        self.state().metadata.insert(hash.clone(), payload);
    }

    /// Concrete handle for a live task.
    #[must_use]
    pub fn loopback_task(&self, id: &InfoHash) -> Option<Arc<LoopbackTask>> {
        self.state().tasks.get(id).cloned()
    }

    /// Complete a magnet fetch.
    ///
    /// Publishes `MagnetMetadata`; when a live task is waiting for the same
    /// hash it receives the metadata and `MetadataLoaded` follows.
    pub fn deliver_metadata(&self, hash: &InfoHash, payload: Option<Vec<u8>>) {
        let (bus, waiting) = {
            let mut state = self.state();
            if let Some(bytes) = &payload {
                state.metadata.insert(hash.clone(), bytes.clone());
            }
            let waiting = state
                .tasks
                .get(hash)
                .filter(|task| !task.has_metadata())
                .cloned();
            (state.bus.clone(), waiting)
        };
        let Some(bus) = bus else {
            warn!(hash = %hash, "metadata delivered before a bus was attached");
            return;
        };
        bus.publish(&Event::MagnetMetadata {
            hash: hash.clone(),
            payload: payload.clone(),
        });

        let Some(task) = waiting else {
            return;
        };
        let error = match payload.as_deref().map(descriptor::decode) {
            Some(Ok(meta)) => {
                task.attach_metadata(meta);
                None
            }
            Some(Err(err)) => Some(format!("{err:#}")),
            None => Some("metadata unavailable".to_string()),
        };
        bus.publish(&Event::MetadataLoaded {
            id: hash.clone(),
            error,
        });
    }

    /// Mark a live task as fully downloaded and publish `TaskFinished`.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::NotFound`] for unknown tasks.
    pub fn finish_task(&self, id: &InfoHash) -> TorrentResult<()> {
        let task = self
            .loopback_task(id)
            .ok_or_else(|| TorrentError::NotFound {
                torrent_id: id.clone(),
            })?;
        task.mark_finished();
        info!(torrent_id = %id, "task finished");
        self.emit(&Event::TaskFinished { id: id.clone() });
        Ok(())
    }

    async fn resolve_source(
        &self,
        params: &AddTorrentParams,
    ) -> TorrentResult<(Option<TorrentMetaInfo>, BTreeSet<String>)> {
        match &params.source {
            TorrentSource::Bytes { bytes } => {
                let meta = self.decode_metadata(bytes)?;
                let trackers = meta.trackers.iter().cloned().collect();
                Ok((Some(meta), trackers))
            }
            TorrentSource::File { path } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|err| TorrentError::io("read_descriptor", path, err))?;
                let meta = self.decode_metadata(&bytes)?;
                let trackers = meta.trackers.iter().cloned().collect();
                Ok((Some(meta), trackers))
            }
            TorrentSource::Magnet { uri } => {
                let magnet = parse_magnet(uri)?;
                if magnet.hash != params.id {
                    return Err(TorrentError::decode("magnet hash does not match request"));
                }
                let meta = self
                    .cached_metadata(&magnet.hash)
                    .map(|bytes| self.decode_metadata(&bytes))
                    .transpose()?;
                let mut trackers: BTreeSet<String> = magnet.trackers.into_iter().collect();
                if let Some(meta) = &meta {
                    trackers.extend(meta.trackers.iter().cloned());
                }
                Ok((meta, trackers))
            }
        }
    }
}

#[async_trait]
impl TransferEngine for LoopbackEngine {
    fn attach(&self, bus: ListenerBus) {
        self.state().bus = Some(bus);
    }

    async fn start(&self, settings: SessionSettings) -> TorrentResult<()> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(TorrentError::operation_failed(
                "start",
                None,
                "scripted start failure",
            ));
        }
        let bus = {
            let mut state = self.state();
            state.settings = settings;
            state.bus.clone()
        };
        self.running.store(true, Ordering::SeqCst);
        info!("loopback session starting");
        if let Some(bus) = bus {
            tokio::spawn(async move {
                bus.publish(&Event::SessionStarted);
            });
        }
        Ok(())
    }

    async fn request_stop(&self) -> TorrentResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let dropped = {
            let mut state = self.state();
            let count = state.tasks.len();
            state.tasks.clear();
            count
        };
        info!(tasks = dropped, "loopback session stopped");
        self.emit(&Event::SessionStopped);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn add_task(&self, params: AddTorrentParams, remove_file: bool) -> TorrentResult<Torrent> {
        if !self.is_running() {
            return Err(TorrentError::EngineUnavailable {
                operation: "add_task",
            });
        }
        let already_exists = || TorrentError::AlreadyExists {
            torrent_id: params.id.clone(),
        };
        let live = self.state().tasks.contains_key(&params.id);
        if live || self.store.get(&params.id).await?.is_some() {
            return Err(already_exists());
        }

        let (meta, trackers) = self.resolve_source(&params).await?;
        if let Some(meta) = &meta {
            if meta.hash != params.id {
                return Err(TorrentError::decode("descriptor hash does not match request"));
            }
        }

        let task = Arc::new(LoopbackTask::new(
            params.id.clone(),
            self.bus(),
            TaskSeed {
                name: params.name.clone(),
                download_path: params.download_path.clone(),
                meta,
                trackers,
                paused: !params.start_after_add,
                sequential: params.sequential_download,
                first_last_piece_priority: params.first_last_piece_priority,
                priorities: params.file_priorities.clone(),
                stream_on_add: params.stream_on_add,
            },
        ));
        {
            let mut state = self.state();
            if state.tasks.contains_key(&params.id) {
                return Err(already_exists());
            }
            state.tasks.insert(params.id.clone(), task);
        }

        let torrent = Torrent::new(
            params.id.clone(),
            params.name.clone(),
            params.download_path.clone(),
        );
        if let Err(err) = self.store.insert(torrent.clone()).await {
            self.state().tasks.remove(&params.id);
            return Err(err);
        }

        if let (true, TorrentSource::File { path }) = (remove_file, &params.source) {
            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %err, "failed to remove descriptor file");
            }
        }

        info!(torrent_id = %params.id, name = %params.name, "task added");
        self.emit(&Event::TaskAdded {
            id: params.id.clone(),
        });
        Ok(torrent)
    }

    fn task(&self, id: &InfoHash) -> Option<Arc<dyn TaskHandle>> {
        self.loopback_task(id)
            .map(|task| task as Arc<dyn TaskHandle>)
    }

    fn task_ids(&self) -> Vec<InfoHash> {
        let mut ids: Vec<InfoHash> = self.state().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn delete_task(&self, id: &InfoHash, with_files: bool) -> TorrentResult<()> {
        let task = self
            .state()
            .tasks
            .remove(id)
            .ok_or_else(|| TorrentError::NotFound {
                torrent_id: id.clone(),
            })?;
        self.store.delete(id).await?;
        if with_files {
            for path in task.payload_files() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "payload file removed"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(TorrentError::io("delete_payload", path, err)),
                }
            }
        }
        info!(torrent_id = %id, with_files, "task deleted");
        Ok(())
    }

    async fn fetch_metadata(&self, magnet: &MagnetInfo) -> TorrentResult<()> {
        *self.state().fetches.entry(magnet.hash.clone()).or_default() += 1;
        debug!(hash = %magnet.hash, "metadata fetch started");
        Ok(())
    }

    fn cached_metadata(&self, hash: &InfoHash) -> Option<Vec<u8>> {
        self.state().metadata.get(hash).cloned()
    }

    async fn cancel_fetch(&self, hash: &InfoHash) -> TorrentResult<()> {
        self.state().cancelled.push(hash.clone());
        debug!(hash = %hash, "metadata fetch cancelled");
        Ok(())
    }

    fn decode_metadata(&self, bytes: &[u8]) -> TorrentResult<TorrentMetaInfo> {
        descriptor::decode(bytes).map_err(|err| TorrentError::decode(format!("{err:#}")))
    }

    async fn restore_all(&self) -> TorrentResult<()> {
        let records = self.store.all().await?;
        let bus = self.bus();
        for record in records {
            let restored = {
                let mut state = self.state();
                if state.broken.contains(&record.id) {
                    false
                } else if state.tasks.contains_key(&record.id) {
                    continue;
                } else {
                    let meta = state
                        .metadata
                        .get(&record.id)
                        .and_then(|bytes| descriptor::decode(bytes).ok());
                    let task = LoopbackTask::new(
                        record.id.clone(),
                        bus.clone(),
                        TaskSeed {
                            name: record.name.clone(),
                            download_path: record.download_path.clone(),
                            meta,
                            ..TaskSeed::default()
                        },
                    );
                    state.tasks.insert(record.id.clone(), Arc::new(task));
                    true
                }
            };
            let event = if restored {
                debug!(torrent_id = %record.id, "task restored");
                Event::TaskLoaded { id: record.id }
            } else {
                warn!(torrent_id = %record.id, "task could not be restored");
                Event::RestoreError { id: record.id }
            };
            if let Some(bus) = &bus {
                bus.publish(&event);
            }
        }
        Ok(())
    }

    async fn pause_all(&self) -> TorrentResult<()> {
        for task in self.state().tasks.values() {
            task.pause()?;
        }
        Ok(())
    }

    async fn resume_all(&self) -> TorrentResult<()> {
        for task in self.state().tasks.values() {
            task.resume()?;
        }
        Ok(())
    }

    async fn pause_all_manually(&self) -> TorrentResult<()> {
        for task in self.state().tasks.values() {
            task.pause_manually()?;
        }
        Ok(())
    }

    async fn resume_all_manually(&self) -> TorrentResult<()> {
        for task in self.state().tasks.values() {
            task.resume_manually()?;
        }
        Ok(())
    }

    fn settings(&self) -> SessionSettings {
        self.state().settings.clone()
    }

    async fn apply_settings(&self, settings: SessionSettings) -> TorrentResult<()> {
        debug!(?settings, "engine settings applied");
        self.state().settings = settings;
        Ok(())
    }

    async fn enable_ip_filter(&self, path: &Path) -> TorrentResult<()> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| TorrentError::io("enable_ip_filter", path, err))?;
        let rule_count = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .count();
        self.emit(&Event::IpFilterParsed { rule_count });
        Ok(())
    }

    fn active_downloads(&self) -> usize {
        self.state()
            .tasks
            .values()
            .filter(|task| task.is_active())
            .count()
    }
}
