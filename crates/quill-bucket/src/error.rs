//! Bucket error type.

use quill_common::Hash256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketError {
    /// A referenced bucket is not present in the store.
    #[error("bucket not found: {0}")]
    NotFound(Hash256),

    /// A bucket payload failed to decode.
    #[error("bucket decode failed: {0}")]
    Decode(String),

    /// A background merge task died.
    #[error("bucket merge failed: {0}")]
    MergeFailed(String),
}
