//! Local filesystem access for the session layer.
#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cinder_torrent_core::{FileSystemFacade, TorrentError, TorrentResult};
use tracing::{debug, warn};

const DOWNLOADS_DIR_NAME: &str = "Downloads";

/// [`FileSystemFacade`] over the local disk.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    temp_dir: PathBuf,
    download_dir: Option<PathBuf>,
}

impl LocalFileSystem {
    /// Filesystem whose scratch space lives in `temp_dir`.
    #[must_use]
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            download_dir: None,
        }
    }

    /// Override the platform default download directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    /// Scratch directory emptied on session stop.
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

impl FileSystemFacade for LocalFileSystem {
    fn read(&self, path: &Path) -> TorrentResult<Vec<u8>> {
        fs::read(path).map_err(|err| TorrentError::io("read", path, err))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> TorrentResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| TorrentError::io("write", parent, err))?;
        }
        fs::write(path, bytes).map_err(|err| TorrentError::io("write", path, err))
    }

    fn delete(&self, path: &Path) -> TorrentResult<()> {
        fs::remove_file(path).map_err(|err| TorrentError::io("delete", path, err))?;
        debug!(path = %path.display(), "file deleted");
        Ok(())
    }

    fn create_file(&self, dir: &Path, name: &str, overwrite: bool) -> TorrentResult<PathBuf> {
        fs::create_dir_all(dir).map_err(|err| TorrentError::io("create_file", dir, err))?;
        let mut candidate = dir.join(name);
        if !overwrite {
            let mut counter = 1_u32;
            while candidate.exists() {
                candidate = dir.join(numbered_name(name, counter));
                counter += 1;
            }
        }
        fs::File::create(&candidate).map_err(|err| TorrentError::io("create_file", &candidate, err))?;
        Ok(candidate)
    }

    fn available_bytes(&self, path: &Path) -> TorrentResult<u64> {
        let probe = nearest_existing(path);
        free_space(&probe).map_err(|err| TorrentError::io("available_bytes", probe, err))
    }

    fn default_download_path(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| {
                dirs.download_dir()
                    .map(Path::to_path_buf)
                    .or_else(|| Some(dirs.home_dir().join(DOWNLOADS_DIR_NAME)))
            })
            .unwrap_or_else(|| self.temp_dir.join(DOWNLOADS_DIR_NAME))
    }

    fn clean_temp_dir(&self) -> TorrentResult<()> {
        let entries = match fs::read_dir(&self.temp_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(TorrentError::io("clean_temp_dir", &self.temp_dir, err)),
        };
        let mut removed = 0_usize;
        for entry in entries {
            let entry = entry.map_err(|err| TorrentError::io("clean_temp_dir", &self.temp_dir, err))?;
            let path = entry.path();
            let outcome = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match outcome {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp entry"),
            }
        }
        debug!(dir = %self.temp_dir.display(), removed, "temp dir cleaned");
        Ok(())
    }
}

/// `movie.mkv` becomes `movie (2).mkv`; names without an extension get the suffix appended.
fn numbered_name(name: &str, counter: u32) -> String {
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|stem| stem.to_str()),
        path.extension().and_then(|ext| ext.to_str()),
    ) {
        (Some(stem), Some(ext)) if !stem.is_empty() => format!("{stem} ({counter}).{ext}"),
        _ => format!("{name} ({counter})"),
    }
}

/// Closest ancestor of `path` that exists; destinations are often created lazily.
fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

#[cfg(unix)]
fn free_space(path: &Path) -> io::Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    #[allow(clippy::useless_conversion)]
    let blocks = u64::from(stats.blocks_available());
    #[allow(clippy::useless_conversion)]
    let fragment = u64::from(stats.fragment_size());
    Ok(blocks.saturating_mul(fragment))
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_file_avoids_collisions_unless_overwriting() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = LocalFileSystem::new(dir.path().join("tmp"));

        let first = fs.create_file(dir.path(), "movie.mkv", false)?;
        let second = fs.create_file(dir.path(), "movie.mkv", false)?;
        let third = fs.create_file(dir.path(), "movie.mkv", false)?;
        assert_eq!(first, dir.path().join("movie.mkv"));
        assert_eq!(second, dir.path().join("movie (1).mkv"));
        assert_eq!(third, dir.path().join("movie (2).mkv"));
        assert_eq!(fs.create_file(dir.path(), "movie.mkv", true)?, first);
        Ok(())
    }

    #[test]
    fn numbered_names_keep_extensions() {
        assert_eq!(numbered_name("a.tar", 3), "a (3).tar");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name(".hidden", 1), ".hidden (1)");
    }

    #[test]
    fn write_read_delete_round() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = LocalFileSystem::new(dir.path().join("tmp"));
        let path = dir.path().join("nested/deeper/file.bin");

        fs.write(&path, b"payload")?;
        assert_eq!(fs.read(&path)?, b"payload");
        fs.delete(&path)?;
        assert!(matches!(fs.read(&path), Err(TorrentError::Io { .. })));
        assert!(fs.delete(&path).is_err());
        Ok(())
    }

    #[test]
    fn free_space_probes_missing_destinations() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = LocalFileSystem::new(dir.path().join("tmp"));
        let missing = dir.path().join("not/yet/created");
        assert!(fs.available_bytes(&missing)? > 0);
        Ok(())
    }

    #[test]
    fn clean_temp_dir_empties_but_keeps_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let temp = dir.path().join("tmp");
        std::fs::create_dir_all(temp.join("sub"))?;
        std::fs::write(temp.join("sub/part"), b"x")?;
        std::fs::write(temp.join("loose"), b"y")?;

        let fs = LocalFileSystem::new(&temp);
        fs.clean_temp_dir()?;
        assert!(temp.exists());
        assert_eq!(std::fs::read_dir(&temp)?.count(), 0);

        LocalFileSystem::new(dir.path().join("absent")).clean_temp_dir()?;
        Ok(())
    }

    #[test]
    fn configured_download_dir_wins() {
        let fs = LocalFileSystem::new("/tmp/cinder").with_download_dir("/srv/downloads");
        assert_eq!(fs.default_download_path(), PathBuf::from("/srv/downloads"));
    }
}
