//! Database error type.

use thiserror::Error;

/// Errors from the durable store. Database failures are fatal for the
/// operation that triggered them; callers surface them instead of retrying.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value failed to parse back.
    #[error("integrity error: {0}")]
    Integrity(String),
}
