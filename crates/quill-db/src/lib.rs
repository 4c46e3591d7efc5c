//! Durable node state on SQLite.
//!
//! The database holds exactly one table owned by the history subsystem: the
//! publish queue. Access goes through [`Database::with_connection`] so
//! callers never hold the raw connection across await points; every
//! statement runs on the single event-loop thread.

mod error;
mod schema;

pub use error::DbError;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

pub type Result<T> = std::result::Result<T, DbError>;

/// Handle to the node's SQLite database.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_connection(schema::apply)?;
        debug!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Open a fresh in-memory database, used by tests and throwaway nodes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_connection(schema::apply)?;
        Ok(db)
    }

    /// Run `f` with the connection held for the duration of the call.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Drop and recreate all tables owned by this database.
    pub fn drop_all(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS publishqueue;")?;
            schema::apply(conn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_has_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM publishqueue", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_connection(|conn| {
                conn.execute(
                    "INSERT INTO publishqueue (ledger, state) VALUES (7, 'x')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }
        // Reopen and confirm the row survived.
        let db = Database::open(&path).unwrap();
        let ledger: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT ledger FROM publishqueue", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(ledger, 7);
    }

    #[test]
    fn test_drop_all_resets() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO publishqueue (ledger, state) VALUES (7, 'x')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db.drop_all().unwrap();
        let count: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM publishqueue", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
