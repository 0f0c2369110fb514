//! Fake collaborators for session tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cinder_torrent_core::{
    EnvironmentProbe, EnvironmentReadings, FileSystemFacade, InfoHash, StreamingEndpoint,
    Torrent, TorrentError, TorrentRepository, TorrentResult,
};
use tokio::sync::watch;

/// Streaming endpoint that records start and stop calls.
#[derive(Debug, Default)]
pub struct RecordingStreaming {
    starts: Mutex<Vec<(String, u16)>>,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    serving: AtomicBool,
    delays: Mutex<(Duration, Duration)>,
}

impl RecordingStreaming {
    /// Make every subsequent `start` fail.
    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Sleep for `start` before binding, and for `stop` after unbinding.
    pub fn delay_calls(&self, start: Duration, stop: Duration) {
        *self.delays.lock().unwrap_or_else(PoisonError::into_inner) = (start, stop);
    }

    /// Whether a successful `start` has not been followed by `stop`.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    fn delays(&self) -> (Duration, Duration) {
        *self.delays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Addresses passed to `start`, in call order.
    #[must_use]
    pub fn starts(&self) -> Vec<(String, u16)> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `stop` calls.
    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingEndpoint for RecordingStreaming {
    async fn start(&self, host: &str, port: u16) -> TorrentResult<()> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((host.to_string(), port));
        let (delay, _) = self.delays();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TorrentError::operation_failed(
                "streaming_start",
                None,
                "address in use",
            ));
        }
        self.serving.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.serving.store(false, Ordering::SeqCst);
        let (_, delay) = self.delays();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Store wrapper whose `update` fails for selected ids.
pub struct FailingStore {
    inner: Arc<dyn TorrentRepository>,
    failing: Mutex<HashSet<InfoHash>>,
}

impl FailingStore {
    /// Wrap `inner`; nothing fails until [`FailingStore::fail_updates_for`].
    #[must_use]
    pub fn wrap(inner: Arc<dyn TorrentRepository>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every later `update` of `id` fail.
    pub fn fail_updates_for(&self, id: &InfoHash) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    fn fails(&self, id: &InfoHash) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

#[async_trait]
impl TorrentRepository for FailingStore {
    async fn insert(&self, torrent: Torrent) -> TorrentResult<()> {
        self.inner.insert(torrent).await
    }

    async fn update(&self, torrent: Torrent) -> TorrentResult<()> {
        if self.fails(&torrent.id) {
            return Err(TorrentError::operation_failed(
                "store_update",
                Some(torrent.id),
                "disk full",
            ));
        }
        self.inner.update(torrent).await
    }

    async fn delete(&self, id: &InfoHash) -> TorrentResult<()> {
        self.inner.delete(id).await
    }

    async fn get(&self, id: &InfoHash) -> TorrentResult<Option<Torrent>> {
        self.inner.get(id).await
    }

    async fn all(&self) -> TorrentResult<Vec<Torrent>> {
        self.inner.all().await
    }

    fn watch(&self, id: &InfoHash) -> watch::Receiver<Option<Torrent>> {
        self.inner.watch(id)
    }
}

/// Environment probe whose readings tests can change at any time.
#[derive(Debug, Default)]
pub struct ScriptedEnvironment {
    readings: Mutex<EnvironmentReadings>,
}

impl ScriptedEnvironment {
    /// Probe starting from `readings`.
    #[must_use]
    pub const fn new(readings: EnvironmentReadings) -> Self {
        Self {
            readings: Mutex::new(readings),
        }
    }

    /// Probe reporting a metered network and otherwise default readings.
    #[must_use]
    pub fn metered() -> Self {
        Self::new(EnvironmentReadings {
            is_metered: true,
            ..EnvironmentReadings::default()
        })
    }

    /// Mutate the current readings.
    pub fn update(&self, change: impl FnOnce(&mut EnvironmentReadings)) {
        change(&mut self.readings.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl EnvironmentProbe for ScriptedEnvironment {
    fn readings(&self) -> EnvironmentReadings {
        *self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Filesystem rooted in a scratch directory with an adjustable free-space figure.
#[derive(Debug)]
pub struct TestFileSystem {
    root: PathBuf,
    available: AtomicU64,
    temp_cleans: AtomicUsize,
}

impl TestFileSystem {
    /// Filesystem rooted at `root` reporting unlimited free space.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            available: AtomicU64::new(u64::MAX),
            temp_cleans: AtomicUsize::new(0),
        }
    }

    /// Report `bytes` of free space from now on.
    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    /// Number of `clean_temp_dir` calls.
    #[must_use]
    pub fn temp_cleans(&self) -> usize {
        self.temp_cleans.load(Ordering::SeqCst)
    }

    /// Scratch directory cleaned on stop.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

impl FileSystemFacade for TestFileSystem {
    fn read(&self, path: &Path) -> TorrentResult<Vec<u8>> {
        std::fs::read(path).map_err(|err| TorrentError::io("read", path, err))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> TorrentResult<()> {
        std::fs::write(path, bytes).map_err(|err| TorrentError::io("write", path, err))
    }

    fn delete(&self, path: &Path) -> TorrentResult<()> {
        std::fs::remove_file(path).map_err(|err| TorrentError::io("delete", path, err))
    }

    fn create_file(&self, dir: &Path, name: &str, overwrite: bool) -> TorrentResult<PathBuf> {
        let mut candidate = dir.join(name);
        let mut counter = 1;
        while !overwrite && candidate.exists() {
            candidate = dir.join(format!("{name} ({counter})"));
            counter += 1;
        }
        std::fs::write(&candidate, b"").map_err(|err| TorrentError::io("create", &candidate, err))?;
        Ok(candidate)
    }

    fn available_bytes(&self, _path: &Path) -> TorrentResult<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    fn default_download_path(&self) -> PathBuf {
        self.root.join("downloads")
    }

    fn clean_temp_dir(&self) -> TorrentResult<()> {
        self.temp_cleans.fetch_add(1, Ordering::SeqCst);
        let dir = self.temp_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TorrentError::io("clean_temp_dir", dir, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streaming_records_calls_and_fails_on_request() {
        let streaming = RecordingStreaming::default();
        assert!(streaming.start("127.0.0.1", 8800).await.is_ok());
        streaming.fail_starts();
        assert!(streaming.start("127.0.0.1", 8801).await.is_err());
        streaming.stop().await;
        assert_eq!(streaming.starts().len(), 2);
        assert_eq!(streaming.stops(), 1);
        assert!(!streaming.is_serving());
    }

    #[tokio::test]
    async fn delayed_streaming_serves_only_after_start_completes() {
        let streaming = RecordingStreaming::default();
        streaming.delay_calls(Duration::from_millis(10), Duration::ZERO);
        assert!(streaming.start("127.0.0.1", 8802).await.is_ok());
        assert!(streaming.is_serving());
        streaming.stop().await;
        assert!(!streaming.is_serving());
    }

    #[test]
    fn environment_updates_are_visible() {
        let env = ScriptedEnvironment::metered();
        assert!(env.readings().is_metered);
        env.update(|readings| readings.is_metered = false);
        assert!(!env.readings().is_metered);
    }

    #[test]
    fn create_file_numbers_collisions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = TestFileSystem::new(dir.path());
        let first = fs.create_file(dir.path(), "a.txt", false)?;
        let second = fs.create_file(dir.path(), "a.txt", false)?;
        assert_ne!(first, second);
        assert_eq!(fs.create_file(dir.path(), "a.txt", true)?, first);

        std::fs::create_dir_all(fs.temp_dir().join("nested"))?;
        fs.clean_temp_dir()?;
        assert!(!fs.temp_dir().exists());
        fs.clean_temp_dir()?;
        assert_eq!(fs.temp_cleans(), 2);
        Ok(())
    }
}
