//! Magnet URI parsing and add-locator classification.

use std::path::PathBuf;

use cinder_events::InfoHash;
use url::Url;

use crate::error::{TorrentError, TorrentResult};
use crate::model::MagnetInfo;

/// Scheme prefix every magnet URI starts with.
pub const MAGNET_PREFIX: &str = "magnet:";
/// Prefix of the exact-topic value carrying a v1 info hash.
pub const BTIH_PREFIX: &str = "urn:btih:";

/// Parse a magnet URI without contacting the engine.
///
/// # Errors
///
/// Returns [`TorrentError::DecodeFailure`] when the URI is malformed or carries
/// no usable `xt=urn:btih:` topic.
pub fn parse_magnet(uri: &str) -> TorrentResult<MagnetInfo> {
    let trimmed = uri.trim();
    if !trimmed
        .get(..MAGNET_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MAGNET_PREFIX))
    {
        return Err(TorrentError::decode("magnet uri must start with magnet:"));
    }
    let url = Url::parse(trimmed).map_err(TorrentError::decode)?;

    let mut hash = None;
    let mut name = None;
    let mut trackers = Vec::new();
    let mut web_seeds = Vec::new();
    for (key, value) in url.query_pairs() {
        // Multi-valued keys may be numbered (`xt.1`, `tr.2`).
        let key = key.split('.').next().unwrap_or_default();
        match key {
            "xt" if hash.is_none() => {
                if let Some(raw) = strip_btih(&value) {
                    hash = InfoHash::parse(raw).ok();
                }
            }
            "dn" if name.is_none() && !value.is_empty() => name = Some(value.into_owned()),
            "tr" if !value.is_empty() => trackers.push(value.into_owned()),
            "ws" if !value.is_empty() => web_seeds.push(value.into_owned()),
            _ => {}
        }
    }

    let hash = hash.ok_or_else(|| TorrentError::decode("magnet uri has no btih topic"))?;
    Ok(MagnetInfo {
        uri: trimmed.to_string(),
        hash,
        name,
        trackers,
        web_seeds,
    })
}

fn strip_btih(value: &str) -> Option<&str> {
    value
        .get(..BTIH_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(BTIH_PREFIX))
        .map(|_| &value[BTIH_PREFIX.len()..])
}

/// Turn a bare hash into a minimal magnet URI; other input is returned unchanged.
#[must_use]
pub fn normalize_magnet_hash(value: &str) -> String {
    let trimmed = value.trim();
    InfoHash::parse(trimmed).map_or_else(
        |_| trimmed.to_string(),
        |hash| format!("{MAGNET_PREFIX}?xt={BTIH_PREFIX}{hash}"),
    )
}

/// `true` when `value` is an absolute http, https or udp tracker URL with a host.
#[must_use]
pub fn is_valid_tracker_url(value: &str) -> bool {
    Url::parse(value.trim()).is_ok_and(|url| {
        matches!(url.scheme(), "http" | "https" | "udp") && url.host_str().is_some()
    })
}

/// Classified add locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Local descriptor file.
    File(PathBuf),
    /// Magnet URI.
    Magnet(String),
}

impl Locator {
    /// Classify a caller-supplied locator.
    ///
    /// Plain paths and `file://` URLs are files, `magnet:` URIs are magnets.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::UnknownSource`] for any other scheme.
    pub fn parse(value: &str) -> TorrentResult<Self> {
        let trimmed = value.trim();
        let unknown = || TorrentError::UnknownSource {
            locator: value.to_string(),
        };
        if trimmed.is_empty() {
            return Err(unknown());
        }
        if trimmed
            .get(..MAGNET_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MAGNET_PREFIX))
        {
            return Ok(Self::Magnet(trimmed.to_string()));
        }
        match Url::parse(trimmed) {
            Ok(url) if url.scheme() == "file" => {
                url.to_file_path().map(Self::File).map_err(|()| unknown())
            }
            // Single-letter schemes are Windows drive prefixes.
            Ok(url) if url.scheme().len() > 1 => Err(unknown()),
            _ => Ok(Self::File(PathBuf::from(trimmed))),
        }
    }
}
