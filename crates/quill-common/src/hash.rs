//! 256-bit content hashes.
//!
//! Every content-addressed object in the system (buckets, ledger headers,
//! transaction sets) is identified by the SHA-256 hash of its canonical
//! encoding. [`Hash256`] is the shared newtype for those identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 256-bit hash value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as "no value" in bucket manifests and as the
    /// previous-hash of the genesis ledger.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Compute the SHA-256 hash of `data`.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Hash256(bytes)
    }

    /// Compute the SHA-256 hash of several chunks, equivalent to hashing
    /// their concatenation without building the intermediate buffer.
    pub fn hash_multi(chunks: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Hash256(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Render as a 64-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s).map_err(|_| HashParseError(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashParseError(s.to_string()))?;
        Ok(Hash256(arr))
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Abbreviate in debug output, full hashes drown log lines.
        write!(f, "Hash256({}..)", &self.to_hex()[..8])
    }
}

/// Error parsing a hex-encoded hash.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid hash: {0:?}")]
pub struct HashParseError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let h = Hash256::hash(b"quill");
        let parsed = Hash256::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_hash_multi_matches_concat() {
        let h1 = Hash256::hash(b"helloworld");
        let h2 = Hash256::hash_multi(&[b"hello", b"world"]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256::hash(b"x").is_zero());
        assert_eq!(Hash256::ZERO.to_hex(), "0".repeat(64));
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(Hash256::from_hex("zz").is_err());
        assert!(Hash256::from_hex(&"ab".repeat(31)).is_err());
    }
}
