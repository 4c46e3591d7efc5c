//! Schema bootstrap.

use rusqlite::Connection;

use crate::Result;

/// Checkpoints pending publication. `state` is the canonical JSON of the
/// archive state snapshotted when the checkpoint ledger closed.
const CREATE_PUBLISH_QUEUE: &str = "CREATE TABLE IF NOT EXISTS publishqueue (
    ledger INTEGER PRIMARY KEY,
    state  TEXT NOT NULL
);";

pub(crate) fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_PUBLISH_QUEUE)?;
    Ok(())
}
