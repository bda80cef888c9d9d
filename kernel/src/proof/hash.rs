//! Canonical hashing: the content-hash type and the single hashing routine.
//!
//! Algorithm: SHA-256 for every artifact. Every call selects a
//! [`HashDomain`] so that hashes from different surfaces can never collide.
//!
//! **Exactly one place defines canonical hashing.**

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub use super::hash_domain::HashDomain;

/// Algorithm tag used by every hash this crate produces.
pub const SHA256: &str = "sha256";

/// A content-addressed hash with algorithm identifier.
///
/// Format: `"algorithm:hex_digest"` (e.g., `"sha256:abcdef..."`)
///
/// Invariant: the inner string always contains exactly one `:` separator,
/// with non-empty substrings on both sides (enforced by [`ContentHash::parse`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash {
    /// Full string in `"algorithm:hex_digest"` format.
    full: String,
    /// Byte offset of the `:` separator (cached from parse).
    colon: usize,
}

impl ContentHash {
    /// Parse from `"algorithm:hex"` format.
    ///
    /// Returns `None` if the format is invalid (missing colon,
    /// empty algorithm, or empty digest).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let colon = s.find(':')?;
        if colon == 0 || colon == s.len() - 1 || s[colon + 1..].contains(':') {
            return None;
        }
        Some(Self {
            full: s.to_string(),
            colon,
        })
    }

    fn from_digest(digest: &[u8]) -> Self {
        let full = format!("{SHA256}:{}", hex::encode(digest));
        Self {
            full,
            colon: SHA256.len(),
        }
    }

    /// The algorithm portion (e.g., "sha256").
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.full[..self.colon]
    }

    /// The hex digest portion.
    #[must_use]
    pub fn hex_digest(&self) -> &str {
        &self.full[self.colon + 1..]
    }

    /// The full string representation (`"algorithm:hex_digest"`).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Decode the digest into raw bytes.
    ///
    /// Returns `None` for non-`sha256` hashes or malformed hex. Chain
    /// computations treat `None` as a mismatch, never as a wildcard.
    #[must_use]
    pub fn raw_bytes(&self) -> Option<[u8; 32]> {
        if self.algorithm() != SHA256 {
            return None;
        }
        let bytes = hex::decode(self.hex_digest()).ok()?;
        bytes.try_into().ok()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("malformed content hash: {raw}")))
    }
}

/// Compute the canonical hash of a byte slice with domain separation.
///
/// Result format: `"sha256:<hex_digest>"`.
#[must_use]
pub fn canonical_hash(domain: HashDomain, data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(data);
    ContentHash::from_digest(&hasher.finalize())
}

/// Compute a chained hash: `sha256(domain || prev_raw || data)`.
///
/// `prev_raw` is the 32-byte digest of the predecessor. A predecessor that
/// cannot be decoded contributes 32 zero bytes, so the resulting hash will
/// never match a correctly chained one.
#[must_use]
pub fn chained_hash(domain: HashDomain, prev: &ContentHash, data: &[u8]) -> ContentHash {
    let prev_raw = prev.raw_bytes().unwrap_or([0u8; 32]);
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(prev_raw);
    hasher.update(data);
    ContentHash::from_digest(&hasher.finalize())
}

/// The well-known chain root every run's first event links to.
#[must_use]
pub fn genesis_hash() -> ContentHash {
    canonical_hash(HashDomain::EventGenesis, &[])
}
