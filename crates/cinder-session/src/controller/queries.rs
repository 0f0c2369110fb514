//! Read-only queries. These bypass the dispatcher and run on the caller's task.

use std::collections::BTreeSet;

use cinder_events::ListenerBus;
use cinder_config::StreamingSettings;
use cinder_torrent_core::{
    InfoHash, MagnetInfo, MediaFile, PlaybackTarget, SpeedLimits, Torrent, TorrentInfo,
    TorrentMetaInfo, parse_magnet, stream_url,
};
use tokio::sync::watch;

use super::{LifecycleState, SessionController};
use crate::error::{SessionError, SessionResult};
use crate::magnet::PendingMetadata;
use crate::needs_start::NeedsStartObserver;

impl SessionController {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// `true` while the engine session is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state() == LifecycleState::Running
    }

    /// Observe lifecycle transitions.
    #[must_use]
    pub fn observe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Bus carrying engine events.
    #[must_use]
    pub fn bus(&self) -> &ListenerBus {
        &self.inner.bus
    }

    /// Level-triggered stream telling whether the session should be started.
    #[must_use]
    pub fn observe_needs_start(&self) -> NeedsStartObserver {
        NeedsStartObserver::spawn(
            self.inner.state.subscribe(),
            self.inner.options.needs_start_interval,
        )
    }

    /// Stored record merged with live engine state.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn torrent_info(&self, id: &InfoHash) -> SessionResult<Option<TorrentInfo>> {
        let record = self
            .inner
            .deps
            .store
            .get(id)
            .await
            .map_err(|err| SessionError::torrent("torrent_info", err))?;
        Ok(record.map(|torrent| self.merge_info(torrent)))
    }

    /// Every stored task merged with live engine state.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn torrent_info_list(&self) -> SessionResult<Vec<TorrentInfo>> {
        let records = self
            .inner
            .deps
            .store
            .all()
            .await
            .map_err(|err| SessionError::torrent("torrent_info_list", err))?;
        Ok(records
            .into_iter()
            .map(|torrent| self.merge_info(torrent))
            .collect())
    }

    fn merge_info(&self, torrent: Torrent) -> TorrentInfo {
        let task = self.inner.live_task(&torrent.id);
        TorrentInfo {
            status: task.as_ref().map(|task| task.status()),
            sequential: task.as_ref().is_some_and(|task| task.is_sequential()),
            first_last_piece_priority: task
                .as_ref()
                .is_some_and(|task| task.is_first_last_piece_priority()),
            file_priorities: task
                .map(|task| task.file_priorities())
                .unwrap_or_default(),
            id: torrent.id,
            name: torrent.name,
            download_path: torrent.download_path,
            date_added: torrent.date_added,
            error: torrent.error,
            visibility: torrent.visibility,
        }
    }

    /// Tracker URLs of a live task; empty when unknown.
    #[must_use]
    pub fn trackers(&self, id: &InfoHash) -> BTreeSet<String> {
        self.inner
            .live_task(id)
            .map(|task| task.trackers())
            .unwrap_or_default()
    }

    /// Per-task rate limits of a live task.
    #[must_use]
    pub fn speed_limits(&self, id: &InfoHash) -> Option<SpeedLimits> {
        self.inner.live_task(id).map(|task| task.speed_limits())
    }

    /// `true` when a live task downloads in order.
    #[must_use]
    pub fn is_sequential(&self, id: &InfoHash) -> bool {
        self.inner
            .live_task(id)
            .is_some_and(|task| task.is_sequential())
    }

    /// `true` when a live task prioritises first and last pieces.
    #[must_use]
    pub fn is_first_last_piece_priority(&self, id: &InfoHash) -> bool {
        self.inner
            .live_task(id)
            .is_some_and(|task| task.is_first_last_piece_priority())
    }

    /// Resolved metadata of a live task.
    #[must_use]
    pub fn metainfo(&self, id: &InfoHash) -> Option<TorrentMetaInfo> {
        self.inner.live_task(id).and_then(|task| task.metainfo())
    }

    /// Magnet URI for a live task.
    #[must_use]
    pub fn make_magnet(&self, id: &InfoHash, include_priorities: bool) -> Option<String> {
        self.inner
            .live_task(id)
            .map(|task| task.make_magnet(include_priorities))
    }

    /// URL serving one file of a live task. Resumes the task if paused.
    ///
    /// `None` when streaming is disabled, the session is not running or the
    /// file index is out of range.
    pub fn stream_url(&self, id: &InfoHash, file_index: usize) -> Option<String> {
        let streaming = self.streaming_settings()?;
        let task = self.inner.live_task(id)?;
        task.file_path(file_index)?;
        self.resume_if_paused(id.clone());
        Some(stream_url(&streaming.host, streaming.port, id, file_index))
    }

    fn streaming_settings(&self) -> Option<StreamingSettings> {
        let streaming = self.inner.deps.settings.snapshot().streaming;
        streaming.enabled.then_some(streaming)
    }

    /// Playable files of a live task in payload order.
    #[must_use]
    pub fn media_files(&self, id: &InfoHash) -> Vec<MediaFile> {
        self.inner
            .live_task(id)
            .map(|task| task.media_files())
            .unwrap_or_default()
    }

    /// First playable file of a live task.
    #[must_use]
    pub fn first_media_file(&self, id: &InfoHash) -> Option<MediaFile> {
        self.media_files(id).into_iter().next()
    }

    /// `true` when a live task holds at least one playable file.
    #[must_use]
    pub fn has_media_file(&self, id: &InfoHash) -> bool {
        !self.media_files(id).is_empty()
    }

    /// `true` when a live task was added with a request to stream right away.
    #[must_use]
    pub fn needs_stream_on_add(&self, id: &InfoHash) -> bool {
        self.inner
            .live_task(id)
            .is_some_and(|task| task.stream_on_add())
    }

    /// Stream URL of the first playable file. Does not resume the task.
    #[must_use]
    pub fn first_media_stream_url(&self, id: &InfoHash) -> Option<String> {
        let streaming = self.streaming_settings()?;
        self.first_media_file(id)
            .map(|file| stream_url(&streaming.host, streaming.port, id, file.index))
    }

    /// Stream URLs of every playable file. Empty when streaming is disabled.
    #[must_use]
    pub fn media_stream_urls(&self, id: &InfoHash) -> Vec<String> {
        let Some(streaming) = self.streaming_settings() else {
            return Vec::new();
        };
        self.media_files(id)
            .iter()
            .map(|file| stream_url(&streaming.host, streaming.port, id, file.index))
            .collect()
    }

    /// Local path for a downloaded file, otherwise its stream URL.
    ///
    /// Streaming a file resumes its task when paused. `None` when the file is
    /// not downloaded and streaming is disabled.
    pub fn file_or_stream_url(&self, file: &MediaFile) -> Option<PlaybackTarget> {
        if file.downloaded {
            return Some(PlaybackTarget::File(file.path.clone()));
        }
        let streaming = self.streaming_settings()?;
        self.resume_if_paused(file.torrent_id.clone());
        Some(PlaybackTarget::Stream(stream_url(
            &streaming.host,
            streaming.port,
            &file.torrent_id,
            file.index,
        )))
    }

    /// Parse a magnet URI without starting a fetch.
    ///
    /// # Errors
    ///
    /// Returns a decode failure for malformed URIs.
    pub fn parse_magnet(&self, uri: &str) -> SessionResult<MagnetInfo> {
        parse_magnet(uri).map_err(|err| SessionError::torrent("parse_magnet", err))
    }

    /// Resolve magnet metadata, sharing in-flight fetches for the same hash.
    ///
    /// Returns `Ok(None)` when the session is not running, including when it
    /// stopped while the fetch was being registered.
    ///
    /// # Errors
    ///
    /// Returns a decode failure for malformed URIs.
    pub async fn fetch_magnet(
        &self,
        uri: &str,
    ) -> SessionResult<Option<(MagnetInfo, PendingMetadata)>> {
        if !self.is_running() {
            return Ok(None);
        }
        let (magnet, pending) = self.inner.magnets.resolve(uri).await?;
        if !self.is_running() {
            // Stop may have swept pending fetches before this one registered.
            pending.cancel().await;
            return Ok(None);
        }
        Ok(Some((magnet, pending)))
    }

    /// Abandon a pending metadata fetch.
    pub async fn cancel_fetch_magnet(&self, hash: &InfoHash) -> bool {
        self.inner.magnets.cancel(hash).await
    }
}
