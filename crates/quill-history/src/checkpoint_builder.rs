//! In-memory accumulation of closed-ledger history.
//!
//! As ledgers close, the node records each header and transaction set so
//! that checkpoint files can be written when the checkpoint boundary is
//! reached. Entries below the last published checkpoint can be pruned.

use std::collections::BTreeMap;

use quill_ledger::{LedgerHeaderHistoryEntry, TxSet};
use serde::{Deserialize, Serialize};

use crate::checkpoint::LedgerRange;

/// The transaction set applied by one ledger, as stored in archive
/// transaction files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHistoryEntry {
    pub ledger_seq: u32,
    pub tx_set: TxSet,
}

/// Accumulator of per-ledger history between checkpoint publications.
#[derive(Default)]
pub struct CheckpointBuilder {
    entries: BTreeMap<u32, (LedgerHeaderHistoryEntry, TransactionHistoryEntry)>,
}

impl CheckpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one closed ledger.
    pub fn append(&mut self, header: LedgerHeaderHistoryEntry, tx_set: TxSet) {
        let seq = header.ledger_seq();
        let tx_entry = TransactionHistoryEntry {
            ledger_seq: seq,
            tx_set,
        };
        self.entries.insert(seq, (header, tx_entry));
    }

    /// Headers for the ledgers of `range` that have been recorded.
    pub fn headers_in(&self, range: LedgerRange) -> Vec<LedgerHeaderHistoryEntry> {
        self.entries
            .range(range.first..=range.last)
            .map(|(_, (header, _))| header.clone())
            .collect()
    }

    /// Transaction entries for the ledgers of `range` that have been
    /// recorded.
    pub fn transactions_in(&self, range: LedgerRange) -> Vec<TransactionHistoryEntry> {
        self.entries
            .range(range.first..=range.last)
            .map(|(_, (_, txs))| txs.clone())
            .collect()
    }

    /// Drop entries at or below `seq`; they belong to published
    /// checkpoints.
    pub fn prune_up_to(&mut self, seq: u32) {
        self.entries = self.entries.split_off(&(seq + 1));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::Hash256;
    use quill_ledger::LedgerHeader;

    fn record(builder: &mut CheckpointBuilder, seq: u32) {
        let header = LedgerHeader {
            ledger_seq: seq,
            previous_ledger_hash: Hash256::ZERO,
            tx_set_hash: Hash256::ZERO,
            bucket_list_hash: Hash256::ZERO,
            close_time: seq as u64,
            protocol_version: 1,
        };
        builder.append(
            LedgerHeaderHistoryEntry::new(header),
            TxSet::new(Hash256::ZERO),
        );
    }

    #[test]
    fn test_range_selection() {
        let mut builder = CheckpointBuilder::new();
        for seq in 1..=20 {
            record(&mut builder, seq);
        }
        let headers = builder.headers_in(LedgerRange::new(8, 15));
        assert_eq!(headers.len(), 8);
        assert_eq!(headers[0].ledger_seq(), 8);
        assert_eq!(headers[7].ledger_seq(), 15);

        let txs = builder.transactions_in(LedgerRange::new(8, 15));
        assert_eq!(txs.len(), 8);
        assert_eq!(txs[0].ledger_seq, 8);
    }

    #[test]
    fn test_prune() {
        let mut builder = CheckpointBuilder::new();
        for seq in 1..=20 {
            record(&mut builder, seq);
        }
        builder.prune_up_to(15);
        assert_eq!(builder.len(), 5);
        assert!(builder.headers_in(LedgerRange::new(1, 15)).is_empty());
        assert_eq!(builder.headers_in(LedgerRange::new(16, 20)).len(), 5);
    }
}
