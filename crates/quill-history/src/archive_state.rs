//! History archive state (HAS).
//!
//! The HAS is the root-of-trust descriptor for one checkpoint: the
//! checkpoint ledger plus the bucket-list manifest at that ledger. It is
//! stored as gzipped JSON both in the archive and, uncompressed, in the
//! durable publish queue.

use quill_bucket::{BucketLevelSnapshot, FutureBucketSnapshot};
use quill_common::Hash256;
use serde::{Deserialize, Serialize};

use crate::{HistoryError, Result};

/// Current HAS format version.
pub const HAS_FORMAT_VERSION: u32 = 1;

/// The state of one history archive at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    pub version: u32,

    #[serde(default)]
    pub server: Option<String>,

    /// Checkpoint ledger this state describes.
    pub current_ledger: u32,

    /// Bucket list levels, shallowest first.
    pub current_buckets: Vec<HasBucketLevel>,
}

/// One bucket-list level in a HAS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasBucketLevel {
    /// Hex hash of the level's current bucket.
    pub curr: String,
    /// Hex hash of the level's snapshot bucket.
    pub snap: String,
    #[serde(default)]
    pub next: HasBucketNext,
}

/// State of a level's pending merge.
///
/// `state` 0 means no merge, 1 means the merge finished and `output` holds
/// the result hash, 2 means the merge was still running when the state was
/// cut and `curr`/`snap` hold its input hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasBucketNext {
    pub state: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap: Option<String>,
}

impl HistoryArchiveState {
    /// Build a HAS from a live bucket-list snapshot.
    pub fn from_snapshot(
        current_ledger: u32,
        snapshot: &[BucketLevelSnapshot],
        server: Option<String>,
    ) -> Self {
        let current_buckets = snapshot
            .iter()
            .map(|level| HasBucketLevel {
                curr: level.curr.to_hex(),
                snap: level.snap.to_hex(),
                next: match &level.next {
                    FutureBucketSnapshot::Clear => HasBucketNext::default(),
                    FutureBucketSnapshot::Output(hash) => HasBucketNext {
                        state: 1,
                        output: Some(hash.to_hex()),
                        ..Default::default()
                    },
                    FutureBucketSnapshot::Inputs { curr, snap } => HasBucketNext {
                        state: 2,
                        curr: Some(curr.to_hex()),
                        snap: Some(snap.to_hex()),
                        ..Default::default()
                    },
                },
            })
            .collect();
        Self {
            version: HAS_FORMAT_VERSION,
            server,
            current_ledger,
            current_buckets,
        }
    }

    /// Convert back to a bucket-list snapshot.
    pub fn to_snapshot(&self) -> Result<Vec<BucketLevelSnapshot>> {
        self.current_buckets
            .iter()
            .map(|level| {
                Ok(BucketLevelSnapshot {
                    curr: parse_hash(&level.curr)?,
                    snap: parse_hash(&level.snap)?,
                    next: match level.next.state {
                        0 => FutureBucketSnapshot::Clear,
                        1 => FutureBucketSnapshot::Output(parse_hash(
                            level.next.output.as_deref().ok_or_else(|| {
                                HistoryError::Decode("next state 1 without output".to_string())
                            })?,
                        )?),
                        2 => FutureBucketSnapshot::Inputs {
                            curr: parse_hash(level.next.curr.as_deref().ok_or_else(|| {
                                HistoryError::Decode("next state 2 without curr".to_string())
                            })?)?,
                            snap: parse_hash(level.next.snap.as_deref().ok_or_else(|| {
                                HistoryError::Decode("next state 2 without snap".to_string())
                            })?)?,
                        },
                        other => {
                            return Err(HistoryError::Decode(format!(
                                "unknown next state {other}"
                            )))
                        }
                    },
                })
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every non-zero bucket hash this state references, including pending
    /// merge inputs and outputs. These are exactly the buckets that must be
    /// retained while the state sits in the publish queue, and the buckets
    /// a catchup must download before adopting the state.
    pub fn all_bucket_hashes(&self) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut push = |hex: &str| {
            if let Ok(hash) = Hash256::from_hex(hex) {
                if !hash.is_zero() {
                    hashes.push(hash);
                }
            }
        };
        for level in &self.current_buckets {
            push(&level.curr);
            push(&level.snap);
            if let Some(ref output) = level.next.output {
                push(output);
            }
            if level.next.state == 2 {
                if let Some(ref curr) = level.next.curr {
                    push(curr);
                }
                if let Some(ref snap) = level.next.snap {
                    push(snap);
                }
            }
        }
        hashes
    }

    /// Deduplicated bucket hashes.
    pub fn unique_bucket_hashes(&self) -> Vec<Hash256> {
        let mut hashes = self.all_bucket_hashes();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    /// Hash of the bucket list this state describes, computed the same way
    /// the live list computes it. Used as a trust anchor against the
    /// verified header at `current_ledger`.
    pub fn bucket_list_hash(&self) -> Result<Hash256> {
        let mut chunks: Vec<[u8; 32]> = Vec::with_capacity(self.current_buckets.len() * 2);
        for level in &self.current_buckets {
            chunks.push(parse_hash(&level.curr)?.0);
            chunks.push(parse_hash(&level.snap)?.0);
        }
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        Ok(Hash256::hash_multi(&refs))
    }
}

fn parse_hash(hex: &str) -> Result<Hash256> {
    Hash256::from_hex(hex).map_err(|e| HistoryError::Decode(e.to_string()))
}
