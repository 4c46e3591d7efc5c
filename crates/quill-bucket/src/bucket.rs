//! Immutable content-addressed buckets.

use quill_common::{AccountEntry, AccountId, Hash256};
use serde::{Deserialize, Serialize};

use crate::{BucketError, Result};

/// Metadata record carried at the front of every bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMeta {
    /// Protocol version the entries were produced under.
    pub protocol_version: u32,
}

/// An immutable set of account-entry deltas, sorted by account id.
///
/// The bucket's identity is the SHA-256 hash of its canonical binary
/// encoding; two buckets with the same entries and metadata are the same
/// bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub meta: BucketMeta,
    entries: Vec<AccountEntry>,
}

impl Bucket {
    /// Build a bucket from entries. Entries are sorted by account id; a
    /// later duplicate of the same account wins.
    pub fn from_entries(meta: BucketMeta, entries: Vec<AccountEntry>) -> Self {
        let mut map: std::collections::BTreeMap<AccountId, AccountEntry> =
            std::collections::BTreeMap::new();
        for entry in entries {
            map.insert(entry.account_id.clone(), entry);
        }
        Self {
            meta,
            entries: map.into_values().collect(),
        }
    }

    pub fn empty(protocol_version: u32) -> Self {
        Self {
            meta: BucketMeta { protocol_version },
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[AccountEntry] {
        &self.entries
    }

    /// Content hash over the canonical encoding.
    pub fn hash(&self) -> Hash256 {
        Hash256::hash(&self.to_bytes())
    }

    /// Canonical binary encoding, as written to archives (pre-gzip).
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("bucket encoding is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| BucketError::Decode(e.to_string()))
    }

    /// Merge `older` with `newer`: union of entries, the newer version of
    /// each account shadowing the older one.
    pub fn merge(older: &Bucket, newer: &Bucket) -> Bucket {
        let mut map: std::collections::BTreeMap<AccountId, AccountEntry> =
            std::collections::BTreeMap::new();
        for entry in older.entries.iter().chain(newer.entries.iter()) {
            map.insert(entry.account_id.clone(), entry.clone());
        }
        Bucket {
            meta: BucketMeta {
                protocol_version: older
                    .meta
                    .protocol_version
                    .max(newer.meta.protocol_version),
            },
            entries: map.into_values().collect(),
        }
    }
}
