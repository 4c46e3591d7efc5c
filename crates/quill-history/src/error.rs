//! Error types for history operations.
//!
//! Errors are grouped by how callers treat them: transient transport
//! problems are retried inside the owning work unit, archive and
//! verification failures end the operation and surface as a status
//! message, database failures are fatal for the node.

use thiserror::Error;

use crate::verify::LedgerVerificationStatus;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// An archive rejected or failed a put/mkdir, or has no usable
    /// command configured.
    #[error("archive unavailable: {0}")]
    ArchiveUnavailable(String),

    /// A requested file does not exist in the archive.
    #[error("missing file: {0}")]
    MissingFile(String),

    /// A downloaded file could not be decompressed or decoded.
    #[error("corrupted archive object: {0}")]
    CorruptedArchive(String),

    /// A content hash did not match its expected value.
    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// The ledger header chain failed verification.
    #[error("ledger chain verification failed ({status:?}): {message}")]
    ChainVerificationFailed {
        status: LedgerVerificationStatus,
        message: String,
    },

    /// The requested ledger is not a checkpoint boundary.
    #[error("not a checkpoint ledger: {0}")]
    NotCheckpointLedger(u32),

    /// Catchup could not proceed.
    #[error("catchup failed: {0}")]
    CatchupFailed(String),

    /// Publication of a queued checkpoint failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// No archive is configured for the requested operation.
    #[error("no archive available")]
    NoArchiveAvailable,

    /// JSON (HAS) serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary payload serialization failure.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bucket-layer error.
    #[error("bucket error: {0}")]
    Bucket(#[from] quill_bucket::BucketError),

    /// Ledger-layer error.
    #[error("ledger error: {0}")]
    Ledger(#[from] quill_ledger::LedgerError),

    /// Database error; fatal for the node.
    #[error("database error: {0}")]
    Database(#[from] quill_db::DbError),
}
