//! Deterministic hashes, descriptors and add requests.

use std::io;
use std::path::{Path, PathBuf};

use cinder_torrent_core::{
    AddTorrentParams, FilePriority, InfoHash, MetaFile, TorrentMetaInfo, TorrentSource,
};
use url::form_urlencoded::byte_serialize;

/// Tracker announced by every fixture descriptor.
pub const FIXTURE_TRACKER: &str = "udp://tracker.example:6969/announce";
/// Payload size of every fixture descriptor.
pub const FIXTURE_PAYLOAD_BYTES: u64 = 64 * 1024;
const FIXTURE_PIECE_LENGTH: u64 = 16 * 1024;

/// Info hash made of `seed` repeated; distinct seeds give distinct hashes.
#[must_use]
pub fn info_hash(seed: u8) -> InfoHash {
    let hex = format!("{seed:02x}").repeat(20);
    InfoHash::parse(&hex).unwrap_or_else(|_| unreachable!("40 hex characters always parse"))
}

/// Magnet URI for `hash` with a display name and the fixture tracker.
#[must_use]
pub fn magnet_uri(hash: &InfoHash, name: &str) -> String {
    let name: String = byte_serialize(name.as_bytes()).collect();
    let tracker: String = byte_serialize(FIXTURE_TRACKER.as_bytes()).collect();
    format!("magnet:?xt=urn:btih:{hash}&dn={name}&tr={tracker}")
}

/// Single-file metadata for `hash`.
#[must_use]
pub fn metainfo(hash: &InfoHash, name: &str) -> TorrentMetaInfo {
    TorrentMetaInfo {
        name: name.to_string(),
        hash: hash.clone(),
        files: vec![MetaFile {
            path: PathBuf::from(name).join("payload.bin"),
            size: FIXTURE_PAYLOAD_BYTES,
        }],
        piece_length: FIXTURE_PIECE_LENGTH,
        num_pieces: FIXTURE_PAYLOAD_BYTES.div_ceil(FIXTURE_PIECE_LENGTH),
        trackers: vec![FIXTURE_TRACKER.to_string()],
    }
}

/// Encoded descriptor the loopback engine accepts.
#[must_use]
pub fn metainfo_json(hash: &InfoHash, name: &str) -> Vec<u8> {
    serde_json::to_vec(&metainfo(hash, name)).unwrap_or_default()
}

/// Encoded descriptor whose payload holds two videos around a text file.
///
/// Files in order: `<name>/<name>.mkv`, `<name>/notes.txt`, `<name>/extra.mp4`.
#[must_use]
pub fn media_metainfo_json(hash: &InfoHash, name: &str) -> Vec<u8> {
    let mut meta = metainfo(hash, name);
    let dir = PathBuf::from(name);
    meta.files = [format!("{name}.mkv"), "notes.txt".into(), "extra.mp4".into()]
        .into_iter()
        .map(|file| MetaFile {
            path: dir.join(file),
            size: FIXTURE_PAYLOAD_BYTES / 4,
        })
        .collect();
    meta.num_pieces = meta.total_size().div_ceil(FIXTURE_PIECE_LENGTH);
    serde_json::to_vec(&meta).unwrap_or_default()
}

/// Write a descriptor for `hash` into `dir/file_name`.
///
/// # Errors
///
/// Returns IO failures from the write.
pub fn write_descriptor(
    dir: &Path,
    file_name: &str,
    hash: &InfoHash,
    name: &str,
) -> io::Result<PathBuf> {
    let path = dir.join(file_name);
    std::fs::write(&path, metainfo_json(hash, name))?;
    Ok(path)
}

/// Add request carrying the fixture descriptor as raw bytes.
#[must_use]
pub fn add_params(hash: &InfoHash, name: &str, download_path: &Path) -> AddTorrentParams {
    let mut params = AddTorrentParams::new(
        TorrentSource::Bytes {
            bytes: metainfo_json(hash, name),
        },
        hash.clone(),
        name,
        download_path,
    );
    params.file_priorities = vec![FilePriority::Default];
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_torrent_core::parse_magnet;

    #[test]
    fn hashes_are_distinct_per_seed() {
        assert_ne!(info_hash(1), info_hash(2));
        assert_eq!(info_hash(171).as_str(), "ab".repeat(20));
    }

    #[test]
    fn magnet_uri_parses_back() -> anyhow::Result<()> {
        let hash = info_hash(9);
        let parsed = parse_magnet(&magnet_uri(&hash, "two words"))?;
        assert_eq!(parsed.hash, hash);
        assert_eq!(parsed.name.as_deref(), Some("two words"));
        assert_eq!(parsed.trackers, vec![FIXTURE_TRACKER.to_string()]);
        Ok(())
    }

    #[test]
    fn descriptor_piece_count_covers_payload() {
        let meta = metainfo(&info_hash(3), "sized");
        assert_eq!(meta.total_size(), FIXTURE_PAYLOAD_BYTES);
        assert_eq!(meta.num_pieces * meta.piece_length, FIXTURE_PAYLOAD_BYTES);
    }

    #[test]
    fn descriptors_land_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_descriptor(dir.path(), "a.torrent", &info_hash(4), "a")?;
        let meta: TorrentMetaInfo = serde_json::from_slice(&std::fs::read(path)?)?;
        assert_eq!(meta.hash, info_hash(4));
        Ok(())
    }
}
