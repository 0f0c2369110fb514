//! Watched-directory ingestion.
//!
//! # Design
//! - Two phases: a sorted startup scan, then `notify` create and rename events.
//! - Candidates are regular files whose name ends with `.torrent` (any case),
//!   re-checked when the event is handled.
//! - A per-path in-flight set drops duplicate events while an ingest for the
//!   same path is pending. Repeats after that rely on the engine rejecting a
//!   known hash with `AlreadyExists`, which counts as success here.
//! - Successful ingests delete the source file when configured; failures are
//!   logged and the file stays.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cinder_torrent_core::{TorrentError, TorrentResult};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};

/// File name suffix picked up by the watcher.
pub const TORRENT_SUFFIX: &str = ".torrent";

/// Destination for files found in the watched directory.
#[async_trait]
pub trait IngestTarget: Send + Sync {
    /// Add the descriptor at `path` as a task.
    async fn ingest(&self, path: &Path) -> SessionResult<()>;

    /// Remove the source file after a successful ingest.
    fn discard(&self, path: &Path) -> TorrentResult<()>;
}

/// Watcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Directory to watch (not recursive).
    pub dir: PathBuf,
    /// Delete source files once ingested.
    pub delete_after_add: bool,
}

/// `true` when `path` names a descriptor file.
#[must_use]
pub fn has_torrent_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| {
            name.len() > TORRENT_SUFFIX.len()
                && name
                    .get(name.len() - TORRENT_SUFFIX.len()..)
                    .is_some_and(|suffix| suffix.eq_ignore_ascii_case(TORRENT_SUFFIX))
        })
}

fn is_candidate(path: &Path) -> bool {
    has_torrent_suffix(path) && path.is_file()
}

/// Running directory watch. Dropping it cancels the watch and pending ingests.
pub struct DirectoryWatcher {
    dir: PathBuf,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Begin watching `options.dir` and scan its current contents.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Watch`] when the directory cannot be watched.
    pub fn start(options: WatchOptions, target: Arc<dyn IngestTarget>) -> SessionResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let watch_error = |source| SessionError::Watch {
            path: options.dir.clone(),
            source,
        };
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = sender.send(event);
        })
        .map_err(watch_error)?;
        watcher
            .watch(&options.dir, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        info!(dir = %options.dir.display(), delete = options.delete_after_add, "watching directory");
        let dir = options.dir.clone();
        let task = tokio::spawn(run(Ingestor::new(options, target), receiver));
        Ok(Self {
            dir,
            task,
            _watcher: watcher,
        })
    }

    /// Watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cancel the watch and every ingest still pending.
    pub fn stop(self) {
        debug!(dir = %self.dir.display(), "directory watch stopped");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut ingestor: Ingestor,
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    for path in scan(&ingestor.options.dir).await {
        ingestor.offer(path);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if is_arrival(event.kind) {
                        for path in event.paths {
                            if is_candidate(&path) {
                                ingestor.offer(path);
                            }
                        }
                    }
                }
                Some(Err(err)) => warn!(error = %err, "directory watch error"),
                None => break,
            },
            Some(joined) = ingestor.jobs.join_next() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        warn!("watched file ingest panicked");
                    }
                }
            }
        }
    }
}

const fn is_arrival(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

async fn scan(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "watched directory scan failed");
            return found;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if is_candidate(&path) {
                    found.push(path);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "watched directory scan interrupted");
                break;
            }
        }
    }
    found.sort();
    debug!(dir = %dir.display(), count = found.len(), "startup scan complete");
    found
}

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

struct Ingestor {
    options: WatchOptions,
    target: Arc<dyn IngestTarget>,
    in_flight: InFlight,
    jobs: JoinSet<()>,
}

impl Ingestor {
    fn new(options: WatchOptions, target: Arc<dyn IngestTarget>) -> Self {
        Self {
            options,
            target,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            jobs: JoinSet::new(),
        }
    }

    /// Start an ingest for `path` unless one is already pending.
    fn offer(&mut self, path: PathBuf) -> bool {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone());
        if !inserted {
            debug!(path = %path.display(), "ingest already pending; event collapsed");
            return false;
        }
        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            path,
        };
        self.jobs.spawn(ingest_one(
            Arc::clone(&self.target),
            self.options.delete_after_add,
            guard,
        ));
        true
    }
}

struct InFlightGuard {
    set: InFlight,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

async fn ingest_one(target: Arc<dyn IngestTarget>, delete_after_add: bool, guard: InFlightGuard) {
    let path = guard.path.as_path();
    if !path.is_file() {
        debug!(path = %path.display(), "watched file vanished before ingest");
        return;
    }

    match target.ingest(path).await {
        Ok(()) => info!(path = %path.display(), "watched file added"),
        Err(err)
            if err
                .torrent_error()
                .is_some_and(TorrentError::is_already_exists) =>
        {
            debug!(path = %path.display(), "watched file already added");
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "watched file not added; leaving in place");
            return;
        }
    }

    if delete_after_add {
        if let Err(err) = target.discard(path) {
            warn!(path = %path.display(), error = %err, "watched file could not be deleted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_events::InfoHash;
    use std::fs;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingIngest {
        ingested: Mutex<Vec<PathBuf>>,
        fail_with_exists: bool,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl RecordingIngest {
        fn ingested(&self) -> Vec<PathBuf> {
            self.ingested.lock().expect("ingested").clone()
        }
    }

    #[async_trait]
    impl IngestTarget for RecordingIngest {
        async fn ingest(&self, path: &Path) -> SessionResult<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.ingested.lock().expect("ingested").push(path.to_path_buf());
            if self.fail_with_exists {
                return Err(SessionError::torrent(
                    "add_torrent_file",
                    TorrentError::AlreadyExists {
                        torrent_id: InfoHash::parse(&"ab".repeat(20)).expect("hash"),
                    },
                ));
            }
            if self.fail {
                return Err(SessionError::torrent(
                    "add_torrent_file",
                    TorrentError::decode("truncated"),
                ));
            }
            Ok(())
        }

        fn discard(&self, path: &Path) -> TorrentResult<()> {
            fs::remove_file(path).map_err(|err| TorrentError::io("discard", path, err))
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[test]
    fn suffix_match_ignores_case() {
        assert!(has_torrent_suffix(Path::new("/w/a.torrent")));
        assert!(has_torrent_suffix(Path::new("/w/B.TORRENT")));
        assert!(!has_torrent_suffix(Path::new("/w/.torrent")));
        assert!(!has_torrent_suffix(Path::new("/w/a.torrent.part")));
        assert!(!has_torrent_suffix(Path::new("/w/notes.txt")));
    }

    #[tokio::test]
    async fn startup_scan_ingests_existing_descriptors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("b.torrent"), b"{}")?;
        fs::write(dir.path().join("a.TORRENT"), b"{}")?;
        fs::write(dir.path().join("readme.txt"), b"ignored")?;
        fs::create_dir(dir.path().join("folder.torrent"))?;

        let target = Arc::new(RecordingIngest::default());
        let watcher = DirectoryWatcher::start(
            WatchOptions {
                dir: dir.path().to_path_buf(),
                delete_after_add: true,
            },
            target.clone(),
        )?;

        wait_until(|| target.ingested().len() == 2).await?;
        wait_until(|| !dir.path().join("b.torrent").exists()).await?;
        assert!(!dir.path().join("a.TORRENT").exists());
        assert!(dir.path().join("readme.txt").exists());
        assert!(dir.path().join("folder.torrent").is_dir());
        watcher.stop();
        Ok(())
    }

    #[tokio::test]
    async fn created_files_are_ingested() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = Arc::new(RecordingIngest::default());
        let watcher = DirectoryWatcher::start(
            WatchOptions {
                dir: dir.path().to_path_buf(),
                delete_after_add: false,
            },
            target.clone(),
        )?;
        sleep(Duration::from_millis(50)).await;

        let staged = dir.path().join("incoming.part");
        fs::write(&staged, b"{}")?;
        fs::rename(&staged, dir.path().join("incoming.torrent"))?;

        wait_until(|| {
            target
                .ingested()
                .iter()
                .any(|path| path.ends_with("incoming.torrent"))
        })
        .await?;
        assert!(dir.path().join("incoming.torrent").exists());
        watcher.stop();
        Ok(())
    }

    #[tokio::test]
    async fn already_added_counts_as_success_and_failures_keep_the_file() -> anyhow::Result<()> {
        let exists_dir = tempfile::tempdir()?;
        fs::write(exists_dir.path().join("dup.torrent"), b"{}")?;
        let exists = Arc::new(RecordingIngest {
            fail_with_exists: true,
            ..RecordingIngest::default()
        });
        let first = DirectoryWatcher::start(
            WatchOptions {
                dir: exists_dir.path().to_path_buf(),
                delete_after_add: true,
            },
            exists.clone(),
        )?;
        wait_until(|| !exists_dir.path().join("dup.torrent").exists()).await?;
        first.stop();

        let failing_dir = tempfile::tempdir()?;
        fs::write(failing_dir.path().join("bad.torrent"), b"{")?;
        let failing = Arc::new(RecordingIngest {
            fail: true,
            ..RecordingIngest::default()
        });
        let second = DirectoryWatcher::start(
            WatchOptions {
                dir: failing_dir.path().to_path_buf(),
                delete_after_add: true,
            },
            failing.clone(),
        )?;
        wait_until(|| failing.ingested().len() == 1).await?;
        sleep(Duration::from_millis(50)).await;
        assert!(failing_dir.path().join("bad.torrent").exists());
        second.stop();
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_offers_collapse_while_pending() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("slow.torrent");
        fs::write(&path, b"{}")?;

        let gate = Arc::new(Notify::new());
        let target = Arc::new(RecordingIngest {
            gate: Some(gate.clone()),
            ..RecordingIngest::default()
        });
        let mut ingestor = Ingestor::new(
            WatchOptions {
                dir: dir.path().to_path_buf(),
                delete_after_add: false,
            },
            target.clone(),
        );

        assert!(ingestor.offer(path.clone()));
        assert!(!ingestor.offer(path.clone()));
        gate.notify_one();
        ingestor.jobs.join_next().await.transpose()?;

        assert_eq!(target.ingested(), vec![path.clone()]);
        assert!(ingestor.offer(path));
        gate.notify_one();
        ingestor.jobs.join_next().await.transpose()?;
        assert_eq!(target.ingested().len(), 2);
        Ok(())
    }

    #[test]
    fn missing_directory_fails_to_start() -> anyhow::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let _guard = runtime.enter();
        let dir = tempfile::tempdir()?;
        let result = DirectoryWatcher::start(
            WatchOptions {
                dir: dir.path().join("absent"),
                delete_after_add: false,
            },
            Arc::new(RecordingIngest::default()),
        );
        assert!(matches!(result, Err(SessionError::Watch { .. })));
        Ok(())
    }
}
