//! Live task state held by the loopback engine.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cinder_events::{Event, ListenerBus};
use cinder_torrent_core::{
    FilePriority, InfoHash, SpeedLimits, TaskHandle, TaskState, TaskStatus, TorrentError,
    TorrentMetaInfo, TorrentResult,
};
use tracing::debug;
use url::form_urlencoded::byte_serialize;

#[derive(Debug, Default)]
struct Slot {
    name: String,
    download_path: PathBuf,
    meta: Option<TorrentMetaInfo>,
    trackers: BTreeSet<String>,
    policy_paused: bool,
    manually_paused: bool,
    finished: bool,
    sequential: bool,
    first_last_piece_priority: bool,
    priorities: Vec<FilePriority>,
    limits: SpeedLimits,
    rechecks: u32,
    announces: u32,
    stream_on_add: bool,
}

/// Seed values for a new loopback task.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSeed {
    pub(crate) name: String,
    pub(crate) download_path: PathBuf,
    pub(crate) meta: Option<TorrentMetaInfo>,
    pub(crate) trackers: BTreeSet<String>,
    pub(crate) paused: bool,
    pub(crate) sequential: bool,
    pub(crate) first_last_piece_priority: bool,
    pub(crate) priorities: Vec<FilePriority>,
    pub(crate) stream_on_add: bool,
}

/// Task handle backed by in-memory state.
pub struct LoopbackTask {
    id: InfoHash,
    bus: Option<ListenerBus>,
    slot: Mutex<Slot>,
}

impl LoopbackTask {
    pub(crate) fn new(id: InfoHash, bus: Option<ListenerBus>, seed: TaskSeed) -> Self {
        let priorities = match (&seed.meta, seed.priorities.is_empty()) {
            (Some(meta), true) => vec![FilePriority::Default; meta.files.len()],
            _ => seed.priorities,
        };
        Self {
            id,
            bus,
            slot: Mutex::new(Slot {
                name: seed.name,
                download_path: seed.download_path,
                meta: seed.meta,
                trackers: seed.trackers,
                manually_paused: seed.paused,
                sequential: seed.sequential,
                first_last_piece_priority: seed.first_last_piece_priority,
                priorities,
                stream_on_add: seed.stream_on_add,
                ..Slot::default()
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: &Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.slot().name.clone()
    }

    /// Current payload directory.
    #[must_use]
    pub fn download_path(&self) -> PathBuf {
        self.slot().download_path.clone()
    }

    /// Whether a user action paused the task.
    #[must_use]
    pub fn is_manually_paused(&self) -> bool {
        self.slot().manually_paused
    }

    /// Number of recheck requests seen.
    #[must_use]
    pub fn recheck_count(&self) -> u32 {
        self.slot().rechecks
    }

    /// Number of announce requests seen.
    #[must_use]
    pub fn announce_count(&self) -> u32 {
        self.slot().announces
    }

    /// Attach resolved metadata. Returns `false` when metadata was already present.
    pub(crate) fn attach_metadata(&self, meta: TorrentMetaInfo) -> bool {
        let mut slot = self.slot();
        if slot.meta.is_some() {
            return false;
        }
        if slot.priorities.len() != meta.files.len() {
            slot.priorities = vec![FilePriority::Default; meta.files.len()];
        }
        slot.trackers.extend(meta.trackers.iter().cloned());
        slot.meta = Some(meta);
        true
    }

    pub(crate) fn has_metadata(&self) -> bool {
        self.slot().meta.is_some()
    }

    pub(crate) fn mark_finished(&self) {
        self.slot().finished = true;
    }

    /// Still transferring payload.
    pub(crate) fn is_active(&self) -> bool {
        let slot = self.slot();
        !slot.finished && !slot.policy_paused && !slot.manually_paused
    }

    pub(crate) fn payload_files(&self) -> Vec<PathBuf> {
        let slot = self.slot();
        slot.meta
            .as_ref()
            .map(|meta| {
                meta.files
                    .iter()
                    .map(|file| slot.download_path.join(&file.path))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TaskHandle for LoopbackTask {
    fn id(&self) -> InfoHash {
        self.id.clone()
    }

    fn status(&self) -> TaskStatus {
        let slot = self.slot();
        let state = if slot.policy_paused || slot.manually_paused {
            TaskState::Paused
        } else if slot.finished {
            TaskState::Finished
        } else if slot.meta.is_none() {
            TaskState::FetchingMetadata
        } else {
            TaskState::Downloading
        };
        let total = slot.meta.as_ref().map_or(0, TorrentMetaInfo::total_size);
        TaskStatus {
            state,
            progress: if slot.finished { 1.0 } else { 0.0 },
            bytes_downloaded: if slot.finished { total } else { 0 },
            ..TaskStatus::default()
        }
    }

    fn is_paused(&self) -> bool {
        let slot = self.slot();
        slot.policy_paused || slot.manually_paused
    }

    fn is_finished(&self) -> bool {
        self.slot().finished
    }

    fn pause(&self) -> TorrentResult<()> {
        self.slot().policy_paused = true;
        Ok(())
    }

    fn resume(&self) -> TorrentResult<()> {
        self.slot().policy_paused = false;
        Ok(())
    }

    fn pause_manually(&self) -> TorrentResult<()> {
        self.slot().manually_paused = true;
        Ok(())
    }

    fn resume_manually(&self) -> TorrentResult<()> {
        self.slot().manually_paused = false;
        Ok(())
    }

    fn force_recheck(&self) -> TorrentResult<()> {
        self.slot().rechecks += 1;
        debug!(torrent_id = %self.id, "recheck requested");
        Ok(())
    }

    fn force_announce(&self) -> TorrentResult<()> {
        self.slot().announces += 1;
        debug!(torrent_id = %self.id, "announce requested");
        Ok(())
    }

    fn trackers(&self) -> BTreeSet<String> {
        self.slot().trackers.clone()
    }

    fn add_trackers(&self, urls: &BTreeSet<String>) -> TorrentResult<()> {
        self.slot().trackers.extend(urls.iter().cloned());
        Ok(())
    }

    fn replace_trackers(&self, urls: &BTreeSet<String>) -> TorrentResult<()> {
        self.slot().trackers.clone_from(urls);
        Ok(())
    }

    fn set_name(&self, name: &str) -> TorrentResult<()> {
        self.slot().name = name.to_string();
        Ok(())
    }

    fn set_download_path(&self, path: &Path) -> TorrentResult<()> {
        self.publish(&Event::TaskMoving {
            id: self.id.clone(),
        });
        self.slot().download_path = path.to_path_buf();
        self.publish(&Event::TaskMoved {
            id: self.id.clone(),
            success: true,
        });
        Ok(())
    }

    fn is_sequential(&self) -> bool {
        self.slot().sequential
    }

    fn set_sequential(&self, sequential: bool) -> TorrentResult<()> {
        self.slot().sequential = sequential;
        Ok(())
    }

    fn is_first_last_piece_priority(&self) -> bool {
        self.slot().first_last_piece_priority
    }

    fn set_first_last_piece_priority(&self, enabled: bool) -> TorrentResult<()> {
        self.slot().first_last_piece_priority = enabled;
        Ok(())
    }

    fn file_priorities(&self) -> Vec<FilePriority> {
        self.slot().priorities.clone()
    }

    fn prioritize_files(&self, priorities: &[FilePriority]) -> TorrentResult<()> {
        let mut slot = self.slot();
        if let Some(meta) = &slot.meta {
            if meta.files.len() != priorities.len() {
                return Err(TorrentError::operation_failed(
                    "prioritize_files",
                    Some(self.id.clone()),
                    format!(
                        "expected {} priorities, got {}",
                        meta.files.len(),
                        priorities.len()
                    ),
                ));
            }
        }
        slot.priorities = priorities.to_vec();
        Ok(())
    }

    fn speed_limits(&self) -> SpeedLimits {
        self.slot().limits
    }

    fn set_speed_limits(&self, limits: SpeedLimits) -> TorrentResult<()> {
        self.slot().limits = limits;
        Ok(())
    }

    fn metainfo(&self) -> Option<TorrentMetaInfo> {
        self.slot().meta.clone()
    }

    fn make_magnet(&self, include_priorities: bool) -> String {
        let slot = self.slot();
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.id);
        uri.push_str("&dn=");
        uri.extend(byte_serialize(slot.name.as_bytes()));
        for tracker in &slot.trackers {
            uri.push_str("&tr=");
            uri.extend(byte_serialize(tracker.as_bytes()));
        }
        if include_priorities && !slot.priorities.is_empty() {
            let selected: Vec<String> = slot
                .priorities
                .iter()
                .enumerate()
                .filter(|(_, priority)| **priority != FilePriority::Ignore)
                .map(|(index, _)| index.to_string())
                .collect();
            uri.push_str("&so=");
            uri.push_str(&selected.join(","));
        }
        uri
    }

    fn file_path(&self, index: usize) -> Option<PathBuf> {
        let slot = self.slot();
        let file = slot.meta.as_ref()?.files.get(index)?;
        Some(slot.download_path.join(&file.path))
    }

    fn stream_on_add(&self) -> bool {
        self.slot().stream_on_add
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_events::EventCategory;
    use cinder_torrent_core::{MetaFile, parse_magnet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task_with_files(count: usize) -> LoopbackTask {
        let id = InfoHash::parse(&"7".repeat(40)).expect("hash");
        let meta = TorrentMetaInfo {
            name: "pack".into(),
            hash: id.clone(),
            files: (0..count)
                .map(|index| MetaFile {
                    path: format!("pack/{index}.bin").into(),
                    size: 1024,
                })
                .collect(),
            piece_length: 1024,
            num_pieces: count as u64,
            trackers: vec!["udp://a.example:80".into()],
        };
        LoopbackTask::new(
            id,
            None,
            TaskSeed {
                name: "pack & co".into(),
                download_path: "/downloads".into(),
                meta: Some(meta.clone()),
                trackers: meta.trackers.iter().cloned().collect(),
                ..TaskSeed::default()
            },
        )
    }

    #[test]
    fn manual_pause_survives_policy_resume() -> TorrentResult<()> {
        let task = task_with_files(1);
        task.pause_manually()?;
        task.pause()?;
        task.resume()?;
        assert!(task.is_paused());
        assert_eq!(task.status().state, TaskState::Paused);
        task.resume_manually()?;
        assert!(!task.is_paused());
        assert_eq!(task.status().state, TaskState::Downloading);
        Ok(())
    }

    #[test]
    fn magnet_export_round_trips_through_parser() -> TorrentResult<()> {
        let task = task_with_files(3);
        task.prioritize_files(&[FilePriority::High, FilePriority::Ignore, FilePriority::Low])?;

        let uri = task.make_magnet(true);
        assert!(uri.ends_with("&so=0,2"));
        let parsed = parse_magnet(&uri)?;
        assert_eq!(parsed.hash, task.id());
        assert_eq!(parsed.name.as_deref(), Some("pack & co"));
        assert_eq!(parsed.trackers, vec!["udp://a.example:80".to_string()]);
        assert!(!task.make_magnet(false).contains("&so="));
        Ok(())
    }

    #[test]
    fn priorities_must_cover_every_file() {
        let task = task_with_files(2);
        assert!(task.prioritize_files(&[FilePriority::High]).is_err());
        assert_eq!(task.file_priorities(), vec![FilePriority::Default; 2]);
    }

    #[test]
    fn file_paths_resolve_under_download_dir() {
        let task = task_with_files(2);
        assert_eq!(
            task.file_path(1),
            Some(PathBuf::from("/downloads/pack/1.bin"))
        );
        assert!(task.file_path(2).is_none());
    }

    #[test]
    fn media_files_skip_non_media_and_track_completion() {
        let id = InfoHash::parse(&"6".repeat(40)).expect("hash");
        let meta = TorrentMetaInfo {
            name: "show".into(),
            hash: id.clone(),
            files: vec![
                MetaFile {
                    path: "show/info.nfo".into(),
                    size: 10,
                },
                MetaFile {
                    path: "show/e01.mkv".into(),
                    size: 700,
                },
                MetaFile {
                    path: "show/e02.mp4".into(),
                    size: 800,
                },
            ],
            piece_length: 1024,
            num_pieces: 2,
            trackers: Vec::new(),
        };
        let task = LoopbackTask::new(
            id.clone(),
            None,
            TaskSeed {
                download_path: "/media".into(),
                meta: Some(meta),
                stream_on_add: true,
                ..TaskSeed::default()
            },
        );

        let media = task.media_files();
        assert_eq!(
            media.iter().map(|file| file.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(media[0].path, PathBuf::from("/media/show/e01.mkv"));
        assert!(media.iter().all(|file| file.torrent_id == id && !file.downloaded));
        assert!(task.stream_on_add());

        task.mark_finished();
        assert!(task.media_files().iter().all(|file| file.downloaded));
    }

    #[test]
    fn tasks_without_metadata_have_no_media() {
        let id = InfoHash::parse(&"5".repeat(40)).expect("hash");
        let task = LoopbackTask::new(id, None, TaskSeed::default());
        assert!(task.media_files().is_empty());
        assert!(!task.stream_on_add());
    }

    #[test]
    fn moving_publishes_progress_events() -> TorrentResult<()> {
        let bus = ListenerBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for category in [EventCategory::TaskMoving, EventCategory::TaskMoved] {
            let seen = Arc::clone(&seen);
            bus.register(category, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let id = InfoHash::parse(&"8".repeat(40)).expect("hash");
        let task = LoopbackTask::new(id, Some(bus), TaskSeed::default());
        task.set_download_path(Path::new("/elsewhere"))?;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(task.download_path(), PathBuf::from("/elsewhere"));
        Ok(())
    }
}
