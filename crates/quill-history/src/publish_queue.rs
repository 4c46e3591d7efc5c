//! The durable publish queue.
//!
//! When the last ledger of a checkpoint closes, the node snapshots its
//! archive state and persists it to the `publishqueue` table before
//! anything else happens. If the node crashes between queueing and
//! publication, the row survives and publication resumes on restart.
//! Publication proceeds in strict ascending ledger order and a row is only
//! deleted after every archive acknowledged the upload.
//!
//! Alongside the durable rows, an in-memory reference multiset pins every
//! bucket a queued state mentions so garbage collection cannot reclaim a
//! bucket an unpublished checkpoint still needs. The multiset is rebuilt
//! from the persisted rows before any collection runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use quill_common::Hash256;
use quill_db::Database;
use tracing::{debug, info};

use crate::{archive_state::HistoryArchiveState, checkpoint::CheckpointScheme, HistoryError, Result};

/// Durable, ordered queue of checkpoints pending publication.
pub struct PublishQueue {
    db: Arc<Database>,
    scheme: CheckpointScheme,
}

impl PublishQueue {
    pub fn new(db: Arc<Database>, scheme: CheckpointScheme) -> Self {
        Self { db, scheme }
    }

    /// Persist a checkpoint's archive state. The ledger must be a
    /// checkpoint boundary.
    pub fn enqueue(&self, ledger: u32, has: &HistoryArchiveState) -> Result<()> {
        if !self.scheme.is_checkpoint_ledger(ledger) {
            return Err(HistoryError::NotCheckpointLedger(ledger));
        }
        let state = has.to_json()?;
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO publishqueue (ledger, state) VALUES (?1, ?2)",
                rusqlite::params![ledger as i64, state],
            )?;
            Ok(())
        })?;
        debug!(ledger, "queued checkpoint for publication");
        Ok(())
    }

    /// Delete a published checkpoint's row.
    pub fn dequeue(&self, ledger: u32) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM publishqueue WHERE ledger = ?1",
                rusqlite::params![ledger as i64],
            )?;
            Ok(())
        })?;
        debug!(ledger, "dequeued published checkpoint");
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.db.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(ledger) FROM publishqueue", [], |row| row.get(0))?)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, ledger: u32) -> Result<bool> {
        let count: i64 = self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(ledger) FROM publishqueue WHERE ledger = ?1",
                rusqlite::params![ledger as i64],
                |row| row.get(0),
            )?)
        })?;
        Ok(count > 0)
    }

    pub fn min_ledger(&self) -> Result<Option<u32>> {
        let min: Option<i64> = self.db.with_connection(|conn| {
            Ok(conn.query_row("SELECT MIN(ledger) FROM publishqueue", [], |row| row.get(0))?)
        })?;
        Ok(min.map(|v| v as u32))
    }

    pub fn max_ledger(&self) -> Result<Option<u32>> {
        let max: Option<i64> = self.db.with_connection(|conn| {
            Ok(conn.query_row("SELECT MAX(ledger) FROM publishqueue", [], |row| row.get(0))?)
        })?;
        Ok(max.map(|v| v as u32))
    }

    /// All queued states in ascending ledger order.
    pub fn snapshot_states(&self) -> Result<Vec<(u32, HistoryArchiveState)>> {
        let rows: Vec<(i64, String)> = self.db.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT ledger, state FROM publishqueue ORDER BY ledger ASC")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(ledger, state)| {
                let has = HistoryArchiveState::from_json(&state)?;
                Ok((ledger as u32, has))
            })
            .collect()
    }

    /// The oldest queued state, if any.
    pub fn next_to_publish(&self) -> Result<Option<(u32, HistoryArchiveState)>> {
        Ok(self.snapshot_states()?.into_iter().next())
    }
}

/// Reference counts of buckets pinned by queued checkpoints.
///
/// A bucket may be referenced by several queued states; it stays pinned
/// until the last referring state is published and removed.
#[derive(Debug, Default)]
pub struct PublishQueueBuckets {
    counts: HashMap<Hash256, usize>,
}

impl PublishQueueBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted queue rows.
    pub fn from_queue(queue: &PublishQueue) -> Result<Self> {
        let mut buckets = Self::new();
        for (_, has) in queue.snapshot_states()? {
            buckets.add_buckets(&has.all_bucket_hashes());
        }
        info!(
            pinned = buckets.counts.len(),
            "restored publish-queue bucket references"
        );
        Ok(buckets)
    }

    pub fn add_buckets(&mut self, hashes: &[Hash256]) {
        for hash in hashes {
            *self.counts.entry(*hash).or_insert(0) += 1;
        }
    }

    pub fn remove_buckets(&mut self, hashes: &[Hash256]) {
        for hash in hashes {
            if let Some(count) = self.counts.get_mut(hash) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(hash);
                }
            }
        }
    }

    /// Every currently pinned bucket.
    pub fn referenced(&self) -> HashSet<Hash256> {
        self.counts.keys().copied().collect()
    }

    pub fn count_of(&self, hash: &Hash256) -> usize {
        self.counts.get(hash).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bucket::{BucketList, BucketStore};
    use quill_common::{AccountEntry, AccountId};

    fn queue() -> PublishQueue {
        PublishQueue::new(
            Arc::new(Database::open_in_memory().unwrap()),
            CheckpointScheme::accelerated(),
        )
    }

    async fn has_at(ledger: u32) -> HistoryArchiveState {
        let mut list = BucketList::new(BucketStore::new(), 1);
        for seq in 1..=ledger {
            list.add_batch(seq, vec![AccountEntry::new(AccountId::new("a"), seq as i64)])
                .await
                .unwrap();
        }
        list.resolve_all_futures().await.unwrap();
        HistoryArchiveState::from_snapshot(ledger, &list.snapshot(), None)
    }

    #[tokio::test]
    async fn test_enqueue_requires_checkpoint_boundary() {
        let queue = queue();
        let has = has_at(8).await;
        assert!(matches!(
            queue.enqueue(8, &has),
            Err(HistoryError::NotCheckpointLedger(8))
        ));
        assert!(queue.enqueue(7, &has).is_ok());
    }

    #[tokio::test]
    async fn test_queue_order_is_ledger_order() {
        let queue = queue();
        queue.enqueue(23, &has_at(23).await).unwrap();
        queue.enqueue(7, &has_at(7).await).unwrap();
        queue.enqueue(15, &has_at(15).await).unwrap();

        let states = queue.snapshot_states().unwrap();
        let ledgers: Vec<u32> = states.iter().map(|(l, _)| *l).collect();
        assert_eq!(ledgers, vec![7, 15, 23]);
        assert_eq!(queue.min_ledger().unwrap(), Some(7));
        assert_eq!(queue.max_ledger().unwrap(), Some(23));
        assert_eq!(queue.next_to_publish().unwrap().unwrap().0, 7);
    }

    #[tokio::test]
    async fn test_dequeue() {
        let queue = queue();
        queue.enqueue(7, &has_at(7).await).unwrap();
        assert!(queue.contains(7).unwrap());
        queue.dequeue(7).unwrap();
        assert!(!queue.contains(7).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_state() {
        let queue = queue();
        let has = has_at(15).await;
        queue.enqueue(15, &has).unwrap();
        let (ledger, loaded) = queue.next_to_publish().unwrap().unwrap();
        assert_eq!(ledger, 15);
        assert_eq!(loaded, has);
    }

    #[tokio::test]
    async fn test_bucket_refcounts() {
        let mut buckets = PublishQueueBuckets::new();
        let a = Hash256::hash(b"a");
        let b = Hash256::hash(b"b");

        buckets.add_buckets(&[a, b]);
        buckets.add_buckets(&[a]);
        assert_eq!(buckets.count_of(&a), 2);
        assert_eq!(buckets.count_of(&b), 1);

        buckets.remove_buckets(&[a, b]);
        assert_eq!(buckets.count_of(&a), 1);
        assert_eq!(buckets.count_of(&b), 0);
        assert!(buckets.referenced().contains(&a));
        assert!(!buckets.referenced().contains(&b));
    }

    #[tokio::test]
    async fn test_refcounts_rebuilt_from_rows() {
        let queue = queue();
        let has7 = has_at(7).await;
        let has15 = has_at(15).await;
        queue.enqueue(7, &has7).unwrap();
        queue.enqueue(15, &has15).unwrap();

        let buckets = PublishQueueBuckets::from_queue(&queue).unwrap();
        for hash in has7.all_bucket_hashes() {
            assert!(buckets.count_of(&hash) >= 1);
        }
        for hash in has15.all_bucket_hashes() {
            assert!(buckets.count_of(&hash) >= 1);
        }
    }
}
