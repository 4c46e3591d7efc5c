//! Ledger headers and their hash chain.

use quill_common::Hash256;
use serde::{Deserialize, Serialize};

/// Header of one closed ledger.
///
/// The header's identity hash is the SHA-256 of its canonical binary
/// encoding; each header records the hash of its predecessor, forming the
/// chain that history verification walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub ledger_seq: u32,
    pub previous_ledger_hash: Hash256,
    pub tx_set_hash: Hash256,
    pub bucket_list_hash: Hash256,
    pub close_time: u64,
    pub protocol_version: u32,
}

impl LedgerHeader {
    /// Compute the header's identity hash.
    pub fn compute_hash(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("header encoding is infallible");
        Hash256::hash(&bytes)
    }
}

/// A header paired with its identity hash, as stored in archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeaderHistoryEntry {
    pub hash: Hash256,
    pub header: LedgerHeader,
}

impl LedgerHeaderHistoryEntry {
    pub fn new(header: LedgerHeader) -> Self {
        let hash = header.compute_hash();
        Self { hash, header }
    }

    pub fn ledger_seq(&self) -> u32 {
        self.header.ledger_seq
    }
}
