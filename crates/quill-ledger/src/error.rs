//! Ledger error type.

use quill_common::Hash256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A close was attempted out of sequence.
    #[error("unexpected ledger sequence: expected {expected}, got {got}")]
    UnexpectedSequence { expected: u32, got: u32 },

    /// The close data does not chain onto the last closed ledger.
    #[error("previous-hash mismatch at ledger {ledger}: expected {expected}, got {got}")]
    PreviousHashMismatch {
        ledger: u32,
        expected: Hash256,
        got: Hash256,
    },

    /// The manager is not in a state that allows the operation.
    #[error("invalid ledger manager state: {0}")]
    InvalidState(String),

    /// Bucket-layer failure during close or state adoption.
    #[error("bucket error: {0}")]
    Bucket(#[from] quill_bucket::BucketError),
}
