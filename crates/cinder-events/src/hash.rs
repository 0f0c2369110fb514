//! Content hash identifiers shared by every task-scoped event.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const HEX_LEN: usize = 40;
const BASE32_LEN: usize = 32;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Stable content hash identifying a transfer task.
///
/// Always stored as 40 lowercase hexadecimal characters. Base32 input (the
/// 32 character form some magnet links carry) is converted on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InfoHash(String);

/// Rejected content hash input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInfoHash {
    /// Raw value that failed to parse.
    pub value: String,
}

impl Display for InvalidInfoHash {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("invalid info hash")
    }
}

impl std::error::Error for InvalidInfoHash {}

impl InfoHash {
    /// Parse a hexadecimal or base32 encoded info hash.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidInfoHash`] when the input is neither 40 hex characters
    /// nor 32 base32 characters.
    pub fn parse(value: &str) -> Result<Self, InvalidInfoHash> {
        let trimmed = value.trim();
        if is_hex_hash(trimmed) {
            return Ok(Self(trimmed.to_ascii_lowercase()));
        }
        if trimmed.len() == BASE32_LEN {
            if let Some(hex) = base32_to_hex(trimmed) {
                return Ok(Self(hex));
            }
        }
        Err(InvalidInfoHash {
            value: value.to_string(),
        })
    }

    /// Lowercase hexadecimal representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns `true` when `value` is a 40 character hexadecimal hash.
#[must_use]
pub fn is_hex_hash(value: &str) -> bool {
    value.len() == HEX_LEN && value.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn base32_to_hex(value: &str) -> Option<String> {
    let mut bits: u64 = 0;
    let mut bit_count = 0_u32;
    let mut bytes = Vec::with_capacity(20);
    for ch in value.bytes() {
        let upper = ch.to_ascii_uppercase();
        let index = BASE32_ALPHABET.iter().position(|&c| c == upper)?;
        bits = (bits << 5) | index as u64;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            bytes.push(((bits >> bit_count) & 0xff) as u8);
        }
    }
    if bytes.len() != HEX_LEN / 2 {
        return None;
    }
    Some(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
}

impl Display for InfoHash {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for InfoHash {
    type Err = InvalidInfoHash;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for InfoHash {
    type Error = InvalidInfoHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InfoHash> for String {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises_hex_case() {
        let hash = InfoHash::parse("C12FE1C06BBA254A9DC9F519B335AA7C1367A88A").expect("valid hex");
        assert_eq!(hash.as_str(), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
    }

    #[test]
    fn parse_converts_base32() {
        // 20 zero bytes encode to 32 'A' characters.
        let hash = InfoHash::parse("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").expect("valid base32");
        assert_eq!(hash.as_str(), "0".repeat(40));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(InfoHash::parse("not-a-hash").is_err());
        assert!(InfoHash::parse(&"z".repeat(40)).is_err());
        assert!(InfoHash::parse(&"1".repeat(32)).is_err());
    }

    #[test]
    fn serde_round_trip_validates() {
        let parsed: Result<InfoHash, _> = serde_json::from_str("\"abc\"");
        assert!(parsed.is_err());
    }
}
