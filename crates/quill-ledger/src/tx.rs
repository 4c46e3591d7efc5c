//! Transactions, transaction sets and ledger close data.

use quill_common::{AccountId, Hash256};
use serde::{Deserialize, Serialize};

/// Operations this node's ledger understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create `destination` funded with `starting_balance` from the source
    /// account. Fails (and is skipped) if the destination already exists.
    CreateAccount {
        destination: AccountId,
        starting_balance: i64,
    },
    /// Transfer `amount` from the source account to `destination`.
    Payment { destination: AccountId, amount: i64 },
}

/// A single transaction: one operation with a source account and that
/// account's next sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub source: AccountId,
    pub seq_num: u64,
    pub operation: Operation,
}

/// The ordered set of transactions applied by one ledger close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSet {
    /// Hash of the ledger this set builds on.
    pub previous_ledger_hash: Hash256,
    pub txs: Vec<Transaction>,
}

impl TxSet {
    pub fn new(previous_ledger_hash: Hash256) -> Self {
        Self {
            previous_ledger_hash,
            txs: Vec::new(),
        }
    }

    pub fn add(&mut self, tx: Transaction) {
        self.txs.push(tx);
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Content hash of the set, covering the previous-ledger anchor and
    /// every transaction in order.
    pub fn contents_hash(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("tx set encoding is infallible");
        Hash256::hash(&bytes)
    }
}

/// Everything needed to close one ledger: the consensus value this node
/// would have externalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCloseData {
    pub ledger_seq: u32,
    pub tx_set: TxSet,
    pub close_time: u64,
}

impl LedgerCloseData {
    pub fn new(ledger_seq: u32, tx_set: TxSet, close_time: u64) -> Self {
        Self {
            ledger_seq,
            tx_set,
            close_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_hash_depends_on_order() {
        let prev = Hash256::hash(b"prev");
        let tx1 = Transaction {
            source: AccountId::new("root"),
            seq_num: 1,
            operation: Operation::Payment {
                destination: AccountId::new("alice"),
                amount: 10,
            },
        };
        let tx2 = Transaction {
            source: AccountId::new("root"),
            seq_num: 2,
            operation: Operation::Payment {
                destination: AccountId::new("bob"),
                amount: 10,
            },
        };

        let mut a = TxSet::new(prev);
        a.add(tx1.clone());
        a.add(tx2.clone());

        let mut b = TxSet::new(prev);
        b.add(tx2);
        b.add(tx1);

        assert_ne!(a.contents_hash(), b.contents_hash());
    }

    #[test]
    fn test_contents_hash_anchored_to_previous() {
        let a = TxSet::new(Hash256::hash(b"one"));
        let b = TxSet::new(Hash256::hash(b"two"));
        assert_ne!(a.contents_hash(), b.contents_hash());
    }
}
