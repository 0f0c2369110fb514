//! Descriptor codec for the loopback engine.
//!
//! Descriptors are JSON encoded [`TorrentMetaInfo`] documents. Decoding checks
//! the structural rules a real bencoded descriptor would enforce: at least one
//! file, relative file paths and a piece count that covers the payload.

use std::path::Component;

use anyhow::{Context, Result, ensure};
use cinder_torrent_core::TorrentMetaInfo;

/// Encode metadata as a loopback descriptor.
///
/// # Errors
///
/// Returns an error if serialisation fails.
pub fn encode(meta: &TorrentMetaInfo) -> Result<Vec<u8>> {
    serde_json::to_vec(meta).context("failed to encode descriptor")
}

/// Decode and validate a loopback descriptor.
///
/// # Errors
///
/// Returns an error when the payload is not a well-formed descriptor.
pub fn decode(bytes: &[u8]) -> Result<TorrentMetaInfo> {
    let meta: TorrentMetaInfo =
        serde_json::from_slice(bytes).context("descriptor is not valid metadata")?;
    ensure!(!meta.name.trim().is_empty(), "descriptor has an empty name");
    ensure!(!meta.files.is_empty(), "descriptor lists no files");
    ensure!(meta.piece_length > 0, "descriptor piece length is zero");
    for file in &meta.files {
        ensure!(
            file.path
                .components()
                .all(|component| matches!(component, Component::Normal(_))),
            "descriptor file path {} escapes the payload directory",
            file.path.display()
        );
    }
    let expected = meta.total_size().div_ceil(meta.piece_length);
    ensure!(
        meta.num_pieces == expected,
        "descriptor declares {} pieces but its files need {expected}",
        meta.num_pieces
    );
    Ok(meta)
}
