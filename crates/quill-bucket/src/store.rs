//! In-memory bucket store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use quill_common::Hash256;
use tracing::debug;

use crate::{Bucket, BucketError, Result};

/// Shared store of buckets by content hash.
///
/// Buckets are immutable once inserted. Garbage collection drops every
/// bucket not in the caller-supplied retain set; the publish queue's pinned
/// buckets must be part of that set, which is why the queue's reference
/// multiset is rebuilt from durable state before any collection runs.
#[derive(Clone, Default)]
pub struct BucketStore {
    buckets: Arc<RwLock<HashMap<Hash256, Arc<Bucket>>>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a bucket, returning its content hash. Inserting the same
    /// bucket twice is a no-op.
    pub fn put(&self, bucket: Bucket) -> Hash256 {
        let hash = bucket.hash();
        self.buckets.write().entry(hash).or_insert_with(|| Arc::new(bucket));
        hash
    }

    pub fn get(&self, hash: &Hash256) -> Result<Arc<Bucket>> {
        self.buckets
            .read()
            .get(hash)
            .cloned()
            .ok_or(BucketError::NotFound(*hash))
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        hash.is_zero() || self.buckets.read().contains_key(hash)
    }

    /// Subset of `hashes` not present locally.
    pub fn missing(&self, hashes: &[Hash256]) -> Vec<Hash256> {
        let buckets = self.buckets.read();
        hashes
            .iter()
            .filter(|h| !h.is_zero() && !buckets.contains_key(h))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Drop every bucket whose hash is not in `retain`.
    pub fn gc(&self, retain: &HashSet<Hash256>) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|hash, _| retain.contains(hash));
        let dropped = before - buckets.len();
        if dropped > 0 {
            debug!(dropped, retained = buckets.len(), "collected buckets");
        }
        dropped
    }
}
