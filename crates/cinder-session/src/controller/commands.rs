//! Mutating commands. Everything here funnels through the task dispatcher.
//!
//! Fire-and-forget commands return the queued unit's ticket, or `None` when
//! the session is not running. Adds are awaited so callers get the task or
//! the failure.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_torrent_core::{
    AddTorrentParams, FilePriority, InfoHash, Locator, PortRange, SessionSettings, SpeedLimits,
    TaskHandle, Torrent, TorrentError, TorrentRepository, TorrentResult, TorrentSource,
    TrackersUpdate, Visibility, is_valid_tracker_url, parse_magnet,
};
use tracing::{debug, info, warn};

use super::SessionController;
use crate::dispatcher::UnitTicket;
use crate::error::{SessionError, SessionResult};
use crate::policy::should_pause;

impl SessionController {
    /// Add a task from fully prepared params.
    ///
    /// # Errors
    ///
    /// Fails with `EngineUnavailable` when the session is not running, or with
    /// the engine's add failure (`AlreadyExists`, `DecodeFailure`, ...).
    pub async fn add_torrent(
        &self,
        params: AddTorrentParams,
        remove_file: bool,
    ) -> SessionResult<Torrent> {
        let engine = self.inner.engine();
        self.inner
            .call("add_torrent", async move {
                engine
                    .add_task(params, remove_file)
                    .await
                    .map_err(|err| SessionError::torrent("add_torrent", err))
            })
            .await
    }

    /// Add several tasks in one unit. Per-item failures are logged and skipped.
    pub fn add_torrents(&self, requests: Vec<AddTorrentParams>) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        self.inner.submit("add_torrents", async move {
            let mut first_error = None;
            for params in requests {
                let id = params.id.clone();
                match engine.add_task(params, false).await {
                    Ok(torrent) => info!(torrent_id = %torrent.id, "task added"),
                    Err(err) if err.is_already_exists() => {
                        debug!(torrent_id = %id, "task already present");
                    }
                    Err(err) => {
                        warn!(torrent_id = %id, error = %err, "bulk add item failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
            outcome("add_torrents", first_error)
        })
    }

    /// Add a task from a raw descriptor.
    ///
    /// Returns `Ok(None)` when the session is not running.
    ///
    /// # Errors
    ///
    /// Returns decode, free-space and engine add failures.
    pub async fn add_torrent_descriptor(
        &self,
        bytes: Vec<u8>,
        download_path: Option<PathBuf>,
    ) -> SessionResult<Option<Torrent>> {
        if !self.is_running() {
            return Ok(None);
        }
        let source = TorrentSource::Bytes {
            bytes: bytes.clone(),
        };
        self.add_decoded("add_torrent_descriptor", source, &bytes, download_path)
            .await
            .map(Some)
    }

    /// Add a task from a descriptor file on disk.
    ///
    /// Returns `Ok(None)` when the session is not running.
    ///
    /// # Errors
    ///
    /// Returns read, decode, free-space and engine add failures.
    pub async fn add_torrent_file(
        &self,
        path: &Path,
        download_path: Option<PathBuf>,
    ) -> SessionResult<Option<Torrent>> {
        if !self.is_running() {
            return Ok(None);
        }
        let bytes = self
            .inner
            .deps
            .fs
            .read(path)
            .map_err(|err| SessionError::torrent("add_torrent_file", err))?;
        self.add_decoded(
            "add_torrent_file",
            TorrentSource::file(path),
            &bytes,
            download_path,
        )
        .await
        .map(Some)
    }

    /// Add from a caller-supplied locator: a path, a `file://` URL or a magnet URI.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSource` for other schemes plus the failures of the
    /// matching add path.
    pub async fn add_torrent_locator(
        &self,
        locator: &str,
        download_path: Option<PathBuf>,
    ) -> SessionResult<Option<Torrent>> {
        match Locator::parse(locator).map_err(|err| SessionError::torrent("add_locator", err))? {
            Locator::File(path) => self.add_torrent_file(&path, download_path).await,
            Locator::Magnet(uri) => self.add_magnet(&uri, download_path).await,
        }
    }

    async fn add_magnet(
        &self,
        uri: &str,
        download_path: Option<PathBuf>,
    ) -> SessionResult<Option<Torrent>> {
        let magnet = parse_magnet(uri).map_err(|err| SessionError::torrent("add_magnet", err))?;
        if !self.is_running() {
            return Ok(None);
        }
        let name = magnet
            .name
            .clone()
            .unwrap_or_else(|| magnet.hash.to_string());
        let params = AddTorrentParams::new(
            TorrentSource::magnet(uri),
            magnet.hash,
            name,
            self.resolve_download_path(download_path),
        );
        self.add_torrent(params, false).await.map(Some)
    }

    async fn add_decoded(
        &self,
        operation: &'static str,
        source: TorrentSource,
        bytes: &[u8],
        download_path: Option<PathBuf>,
    ) -> SessionResult<Torrent> {
        let engine = self.inner.engine();
        let meta = engine
            .decode_metadata(bytes)
            .map_err(|err| SessionError::torrent(operation, err))?;

        let mut params = AddTorrentParams::new(
            source,
            meta.hash.clone(),
            meta.name.clone(),
            self.resolve_download_path(download_path),
        );
        params.file_priorities = vec![FilePriority::Default; meta.files.len()];
        self.ensure_free_space(operation, &params, meta.total_size())?;

        self.inner
            .call(operation, async move {
                engine
                    .add_task(params, false)
                    .await
                    .map_err(|err| SessionError::torrent(operation, err))
            })
            .await
    }

    fn resolve_download_path(&self, requested: Option<PathBuf>) -> PathBuf {
        requested
            .or_else(|| self.inner.deps.settings.snapshot().storage.download_dir)
            .unwrap_or_else(|| self.inner.deps.fs.default_download_path())
    }

    fn ensure_free_space(
        &self,
        operation: &'static str,
        params: &AddTorrentParams,
        required: u64,
    ) -> SessionResult<()> {
        if params.ignore_free_space {
            return Ok(());
        }
        let available = self
            .inner
            .deps
            .fs
            .available_bytes(&params.download_path)
            .map_err(|err| SessionError::torrent(operation, err))?;
        if available < required {
            warn!(
                torrent_id = %params.id,
                required,
                available,
                "not enough free space for task"
            );
            return Err(SessionError::torrent(
                operation,
                TorrentError::InsufficientSpace {
                    required,
                    available,
                },
            ));
        }
        Ok(())
    }

    /// Delete one task, optionally with its downloaded files.
    pub fn delete_torrent(&self, id: InfoHash, with_files: bool) -> Option<UnitTicket> {
        self.delete_torrents(vec![id], with_files)
    }

    /// Delete several tasks. Unknown ids are skipped.
    pub fn delete_torrents(&self, ids: Vec<InfoHash>, with_files: bool) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        self.inner.submit("delete_torrents", async move {
            let mut first_error = None;
            for id in ids {
                if engine.task(&id).is_none() {
                    debug!(torrent_id = %id, "delete skipped; task not found");
                    continue;
                }
                match engine.delete_task(&id, with_files).await {
                    Ok(()) => info!(torrent_id = %id, with_files, "task deleted"),
                    Err(err) => {
                        warn!(torrent_id = %id, error = %err, "task delete failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
            outcome("delete_torrents", first_error)
        })
    }

    /// Pause tasks on behalf of the user.
    pub fn pause_torrents(&self, ids: Vec<InfoHash>) -> Option<UnitTicket> {
        self.for_each_task("pause_torrents", ids, |task| task.pause_manually())
    }

    /// Resume tasks on behalf of the user.
    pub fn resume_torrents(&self, ids: Vec<InfoHash>) -> Option<UnitTicket> {
        self.for_each_task("resume_torrents", ids, |task| task.resume_manually())
    }

    /// Flip a task between paused and running.
    pub fn pause_resume_torrent(&self, id: InfoHash) -> Option<UnitTicket> {
        self.for_each_task("pause_resume_torrent", vec![id], |task| {
            if task.is_paused() {
                task.resume_manually()
            } else {
                task.pause_manually()
            }
        })
    }

    /// Resume a task only if it is currently paused.
    pub fn resume_if_paused(&self, id: InfoHash) -> Option<UnitTicket> {
        self.for_each_task("resume_if_paused", vec![id], |task| {
            if task.is_paused() {
                task.resume_manually()
            } else {
                Ok(())
            }
        })
    }

    /// Pause every task on behalf of the user.
    pub fn pause_all(&self) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        self.inner.submit("pause_all", async move {
            engine
                .pause_all_manually()
                .await
                .map_err(|err| SessionError::torrent("pause_all", err))
        })
    }

    /// Resume every task on behalf of the user.
    pub fn resume_all(&self) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        self.inner.submit("resume_all", async move {
            engine
                .resume_all_manually()
                .await
                .map_err(|err| SessionError::torrent("resume_all", err))
        })
    }

    /// Re-verify downloaded pieces.
    pub fn force_recheck(&self, ids: Vec<InfoHash>) -> Option<UnitTicket> {
        self.for_each_task("force_recheck", ids, |task| task.force_recheck())
    }

    /// Announce to trackers now.
    pub fn force_announce(&self, ids: Vec<InfoHash>) -> Option<UnitTicket> {
        self.for_each_task("force_announce", ids, |task| task.force_announce())
    }

    /// Add, replace or remove tracker URLs. Invalid URLs are dropped.
    pub fn update_trackers(&self, id: InfoHash, update: TrackersUpdate) -> Option<UnitTicket> {
        self.for_each_task("update_trackers", vec![id], move |task| match &update {
            TrackersUpdate::Add { urls } => task.add_trackers(&valid_trackers(urls)),
            TrackersUpdate::Replace { urls } => task.replace_trackers(&valid_trackers(urls)),
            TrackersUpdate::Remove { urls } => {
                let remaining: BTreeSet<String> =
                    task.trackers().difference(urls).cloned().collect();
                task.replace_trackers(&remaining)
            }
        })
    }

    /// Rename a task in the engine and the store.
    pub fn set_torrent_name(&self, id: InfoHash, name: String) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        let store = self.inner.store();
        self.inner.submit("set_torrent_name", async move {
            let Some(task) = engine.task(&id) else {
                return Ok(());
            };
            task.set_name(&name)
                .map_err(|err| SessionError::torrent("set_torrent_name", err))?;
            update_record(store.as_ref(), &id, |torrent| {
                torrent.name = name;
            })
            .await
            .map_err(|err| SessionError::torrent("set_torrent_name", err))
        })
    }

    /// Move task storage to `path` and record the new location.
    pub fn set_download_path(&self, ids: Vec<InfoHash>, path: PathBuf) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        let store = self.inner.store();
        self.inner.submit("set_download_path", async move {
            let mut first_error = None;
            for id in ids {
                let Some(task) = engine.task(&id) else {
                    continue;
                };
                if let Err(err) = task.set_download_path(&path) {
                    warn!(torrent_id = %id, error = %err, "task move failed");
                    first_error.get_or_insert(err);
                    continue;
                }
                let target = path.clone();
                let recorded = update_record(store.as_ref(), &id, move |torrent| {
                    torrent.download_path = target;
                })
                .await;
                if let Err(err) = recorded {
                    warn!(torrent_id = %id, error = %err, "moved task not recorded");
                    first_error.get_or_insert(err);
                }
            }
            outcome("set_download_path", first_error)
        })
    }

    /// Toggle in-order piece download.
    pub fn set_sequential(&self, ids: Vec<InfoHash>, enabled: bool) -> Option<UnitTicket> {
        self.for_each_task("set_sequential", ids, move |task| {
            task.set_sequential(enabled)
        })
    }

    /// Toggle first/last piece priority.
    pub fn set_first_last_piece_priority(
        &self,
        ids: Vec<InfoHash>,
        enabled: bool,
    ) -> Option<UnitTicket> {
        self.for_each_task("set_first_last_piece_priority", ids, move |task| {
            task.set_first_last_piece_priority(enabled)
        })
    }

    /// Replace per-file priorities.
    pub fn prioritize_files(
        &self,
        id: InfoHash,
        priorities: Vec<FilePriority>,
    ) -> Option<UnitTicket> {
        self.for_each_task("prioritize_files", vec![id], move |task| {
            task.prioritize_files(&priorities)
        })
    }

    /// Set per-task rate limits.
    pub fn set_speed_limits(&self, id: InfoHash, limits: SpeedLimits) -> Option<UnitTicket> {
        self.for_each_task("set_speed_limits", vec![id], move |task| {
            task.set_speed_limits(limits)
        })
    }

    /// Update the stored visibility flag. Works whether or not the engine runs.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn set_visibility(
        &self,
        ids: &[InfoHash],
        visibility: Visibility,
    ) -> SessionResult<()> {
        let store = self.inner.store();
        for id in ids {
            update_record(store.as_ref(), id, |torrent| {
                torrent.visibility = visibility;
            })
            .await
            .map_err(|err| SessionError::torrent("set_visibility", err))?;
        }
        Ok(())
    }

    /// Re-evaluate the scheduling policy and pause or resume everything.
    pub fn reschedule(&self) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        let settings = Arc::clone(&self.inner.deps.settings);
        let environment = Arc::clone(&self.inner.deps.environment);
        self.inner.submit("reschedule", async move {
            let policy = settings.snapshot().scheduling;
            let readings = environment.readings();
            let result = if should_pause(&policy, &readings) {
                info!(?readings, "scheduling policy pauses transfers");
                engine.pause_all().await
            } else {
                debug!(?readings, "scheduling policy allows transfers");
                engine.resume_all().await
            };
            result.map_err(|err| SessionError::torrent("reschedule", err))
        })
    }

    /// Push new session settings into the engine.
    pub fn apply_session_settings(&self, settings: SessionSettings) -> Option<UnitTicket> {
        let engine = self.inner.engine();
        self.inner.submit("apply_session_settings", async move {
            engine
                .apply_settings(settings)
                .await
                .map_err(|err| SessionError::torrent("apply_session_settings", err))
        })
    }

    /// Toggle random listen ports. Disabling restores the default port range.
    pub fn set_random_port(&self, enabled: bool) -> Option<UnitTicket> {
        self.reconfigure("set_random_port", move |settings| {
            settings.use_random_port = enabled;
            if !enabled {
                settings.port_range = PortRange::DEFAULT;
            }
        })
    }

    /// Set the listen port range. Ignored unless both bounds are given and ordered.
    pub fn set_port_range(&self, first: Option<u16>, second: Option<u16>) -> Option<UnitTicket> {
        let (Some(first), Some(second)) = (first, second) else {
            debug!("port range ignored; bound missing");
            return None;
        };
        if first == 0 || first > second {
            warn!(first, second, "port range ignored; invalid bounds");
            return None;
        }
        self.reconfigure("set_port_range", move |settings| {
            settings.port_range = PortRange { first, second };
        })
    }

    fn reconfigure<F>(&self, operation: &'static str, change: F) -> Option<UnitTicket>
    where
        F: FnOnce(&mut SessionSettings) + Send + 'static,
    {
        let engine = self.inner.engine();
        self.inner.submit(operation, async move {
            let mut settings = engine.settings();
            change(&mut settings);
            engine
                .apply_settings(settings)
                .await
                .map_err(|err| SessionError::torrent(operation, err))
        })
    }

    /// Wait for every command queued so far. No-op when not running.
    ///
    /// # Errors
    ///
    /// Returns `DispatcherClosed` when the session stopped meanwhile.
    pub async fn flush(&self) -> SessionResult<()> {
        match self.inner.running_dispatcher() {
            Some(dispatcher) => dispatcher.flush().await,
            None => Ok(()),
        }
    }

    fn for_each_task<F>(
        &self,
        operation: &'static str,
        ids: Vec<InfoHash>,
        apply: F,
    ) -> Option<UnitTicket>
    where
        F: Fn(&dyn TaskHandle) -> TorrentResult<()> + Send + 'static,
    {
        let engine = self.inner.engine();
        self.inner.submit(operation, async move {
            let mut first_error = None;
            for id in ids {
                let Some(task) = engine.task(&id) else {
                    debug!(torrent_id = %id, operation, "task not found; skipped");
                    continue;
                };
                if let Err(err) = apply(task.as_ref()) {
                    warn!(torrent_id = %id, operation, error = %err, "task operation failed");
                    first_error.get_or_insert(err);
                }
            }
            outcome(operation, first_error)
        })
    }
}

fn outcome(operation: &'static str, first_error: Option<TorrentError>) -> SessionResult<()> {
    first_error.map_or(Ok(()), |err| Err(SessionError::torrent(operation, err)))
}

fn valid_trackers(urls: &BTreeSet<String>) -> BTreeSet<String> {
    urls.iter()
        .filter(|url| {
            let valid = is_valid_tracker_url(url);
            if !valid {
                warn!(url = %url, "invalid tracker url dropped");
            }
            valid
        })
        .cloned()
        .collect()
}

/// Apply `change` to the stored record of `id`; missing records are skipped.
async fn update_record(
    store: &dyn TorrentRepository,
    id: &InfoHash,
    change: impl FnOnce(&mut Torrent) + Send,
) -> TorrentResult<()> {
    let Some(mut torrent) = store.get(id).await? else {
        return Ok(());
    };
    change(&mut torrent);
    store.update(torrent).await
}
