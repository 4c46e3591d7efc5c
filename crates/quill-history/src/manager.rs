//! The history manager.
//!
//! Owns the publish side of the subsystem: recording closed ledgers,
//! queueing checkpoints when their last ledger closes, pinning the buckets
//! queued states reference, and driving the publish pipeline strictly in
//! ledger order with at most one checkpoint in flight.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use quill_bucket::BucketStore;
use quill_common::{Hash256, MeterRegistry, Outcome, StatusCategory, StatusManager};
use quill_db::Database;
use quill_ledger::{LedgerHeaderHistoryEntry, LedgerManager, TxSet};
use tracing::{debug, info, warn};

use crate::{
    archive::ArchiveManager,
    archive_state::HistoryArchiveState,
    checkpoint::{CheckpointScheme, LedgerRange},
    checkpoint_builder::CheckpointBuilder,
    publish::{
        PutSnapshotFilesWork, ResolveSnapshotWork, SharedSnapshot, StateSnapshot,
        WriteSnapshotWork,
    },
    publish_queue::{PublishQueue, PublishQueueBuckets},
    HistoryError, Result, METER_DOMAIN,
};

/// Meter name for publish outcomes.
pub const METER_PUBLISH: &str = "publish";

/// Server identifier stamped into published archive states.
const SERVER_NAME: &str = "quill";

/// The publish side of the history subsystem.
pub struct HistoryManager {
    queue: PublishQueue,
    queue_buckets: parking_lot::Mutex<Option<PublishQueueBuckets>>,
    builder: parking_lot::Mutex<CheckpointBuilder>,
    archives: Arc<ArchiveManager>,
    store: BucketStore,
    meters: MeterRegistry,
    status: StatusManager,
    scheme: CheckpointScheme,
    publish_queued: AtomicU64,
    /// Held while a publish pipeline is in flight; enforces at most one.
    publishing: tokio::sync::Mutex<()>,
}

impl HistoryManager {
    pub fn new(
        db: Arc<Database>,
        archives: Arc<ArchiveManager>,
        store: BucketStore,
        meters: MeterRegistry,
        status: StatusManager,
        scheme: CheckpointScheme,
    ) -> Self {
        Self {
            queue: PublishQueue::new(db, scheme),
            queue_buckets: parking_lot::Mutex::new(None),
            builder: parking_lot::Mutex::new(CheckpointBuilder::new()),
            archives,
            store,
            meters,
            status,
            scheme,
            publish_queued: AtomicU64::new(0),
            publishing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn scheme(&self) -> CheckpointScheme {
        self.scheme
    }

    pub fn archives(&self) -> &ArchiveManager {
        &self.archives
    }

    /// Record a closed ledger for later checkpoint publication.
    pub fn on_ledger_closed(&self, header: LedgerHeaderHistoryEntry, tx_set: TxSet) {
        self.builder.lock().append(header, tx_set);
    }

    /// Queue the just-closed checkpoint if the close landed on a boundary
    /// and at least one archive can be written. Returns whether a
    /// checkpoint was queued.
    pub fn maybe_queue_checkpoint(&self, lm: &LedgerManager) -> Result<bool> {
        let next = lm.last_closed_seq() + 1;
        if next != self.scheme.next_checkpoint_ledger(next) {
            return Ok(false);
        }
        if !self.archives.has_any_writable() {
            debug!("skipping checkpoint, no writable history archive");
            return Ok(false);
        }
        self.queue_current_history(lm)?;
        Ok(true)
    }

    /// Snapshot the current archive state and persist it to the publish
    /// queue. A persistence failure propagates to the caller and aborts
    /// the enclosing ledger close.
    fn queue_current_history(&self, lm: &LedgerManager) -> Result<()> {
        let ledger = lm.last_closed_seq();
        let has = HistoryArchiveState::from_snapshot(
            ledger,
            &lm.bucket_list().snapshot(),
            Some(SERVER_NAME.to_string()),
        );
        debug!(ledger, "queueing publish state");
        self.queue.enqueue(ledger, &has)?;

        // The row is durable; pin its buckets in memory so collection
        // cannot reclaim them before publication, including the inputs of
        // merges that were still running when the state was cut.
        self.with_queue_buckets(|buckets| {
            buckets.add_buckets(&has.all_bucket_hashes());
            Ok(())
        })?;
        self.publish_queued.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn with_queue_buckets<T>(
        &self,
        f: impl FnOnce(&mut PublishQueueBuckets) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.queue_buckets.lock();
        if guard.is_none() {
            *guard = Some(PublishQueueBuckets::from_queue(&self.queue)?);
        }
        f(guard.as_mut().expect("loaded above"))
    }

    /// Every bucket hash referenced by a queued state. Rebuilt from the
    /// durable rows on first use after startup, before any collection.
    pub fn referenced_buckets(&self) -> Result<HashSet<Hash256>> {
        self.with_queue_buckets(|buckets| Ok(buckets.referenced()))
    }

    /// Referenced buckets not present in the local store.
    pub fn missing_buckets(&self) -> Result<Vec<Hash256>> {
        let referenced: Vec<Hash256> = self.referenced_buckets()?.into_iter().collect();
        Ok(self.store.missing(&referenced))
    }

    /// Drop every stored bucket not referenced by the live bucket list or
    /// a queued checkpoint.
    pub fn collect_buckets(&self, lm: &LedgerManager) -> Result<usize> {
        let mut retain = self.referenced_buckets()?;
        retain.extend(lm.bucket_list().referenced_hashes());
        Ok(self.store.gc(&retain))
    }

    pub fn publish_queue_length(&self) -> Result<usize> {
        self.queue.len()
    }

    pub fn min_ledger_queued_to_publish(&self) -> Result<Option<u32>> {
        self.queue.min_ledger()
    }

    pub fn max_ledger_queued_to_publish(&self) -> Result<Option<u32>> {
        self.queue.max_ledger()
    }

    /// All queued archive states in ascending ledger order.
    pub fn snapshot_states(&self) -> Result<Vec<(u32, HistoryArchiveState)>> {
        self.queue.snapshot_states()
    }

    /// Checkpoints queued since startup.
    pub fn publish_queued_count(&self) -> u64 {
        self.publish_queued.load(AtomicOrdering::SeqCst)
    }

    pub fn publish_success_count(&self) -> u64 {
        self.meters
            .count(METER_DOMAIN, METER_PUBLISH, Outcome::Success)
    }

    pub fn publish_failure_count(&self) -> u64 {
        self.meters
            .count(METER_DOMAIN, METER_PUBLISH, Outcome::Failure)
    }

    /// Publish queued checkpoints in ascending order until the queue is
    /// empty or an entry fails. At most one pipeline runs at a time; a
    /// second caller returns immediately with 0.
    pub async fn publish_queued_history(&self) -> Result<usize> {
        let Ok(_guard) = self.publishing.try_lock() else {
            return Ok(0);
        };

        let mut published = 0;
        while let Some((ledger, has)) = self.queue.next_to_publish()? {
            self.log_and_update_publish_status()?;
            let original_buckets = has.all_bucket_hashes();
            match self.publish_one(ledger, has).await {
                Ok(()) => {
                    self.history_published(ledger, &original_buckets, true)?;
                    published += 1;
                }
                Err(e) => {
                    self.history_published(ledger, &original_buckets, false)?;
                    self.status.set_status(
                        StatusCategory::HistoryPublish,
                        format!("publish of checkpoint {ledger} failed: {e}"),
                    );
                    return Err(e);
                }
            }
        }
        self.log_and_update_publish_status()?;
        Ok(published)
    }

    /// Run the three-phase pipeline for one queued checkpoint.
    async fn publish_one(&self, ledger: u32, has: HistoryArchiveState) -> Result<()> {
        let range = LedgerRange::new(self.scheme.first_ledger_of_checkpoint(ledger), ledger);
        let (headers, transactions) = {
            let builder = self.builder.lock();
            (builder.headers_in(range), builder.transactions_in(range))
        };
        if headers.len() != range.count() as usize {
            return Err(HistoryError::PublishFailed(format!(
                "recorded {} of {} headers for checkpoint {ledger}",
                headers.len(),
                range.count()
            )));
        }

        let snapshot: SharedSnapshot = Arc::new(tokio::sync::Mutex::new(StateSnapshot {
            checkpoint_ledger: ledger,
            has,
            headers,
            transactions,
            dir: tempfile::TempDir::new()?,
            files: Vec::new(),
        }));

        let mut scheduler = quill_work::WorkScheduler::default();
        let mut sequence = quill_work::WorkSequence::new();
        sequence.push(
            &mut scheduler,
            Box::new(ResolveSnapshotWork::new(snapshot.clone(), self.store.clone())),
            0,
        );
        sequence.push(
            &mut scheduler,
            Box::new(WriteSnapshotWork::new(snapshot.clone(), self.store.clone())),
            0,
        );
        sequence.push(
            &mut scheduler,
            Box::new(PutSnapshotFilesWork::new(
                snapshot.clone(),
                self.archives.writable_archives(),
            )),
            1,
        );
        scheduler.run_until_done().await;

        if scheduler.all_succeeded() {
            Ok(())
        } else {
            let detail = sequence
                .ids()
                .iter()
                .find_map(|id| scheduler.last_error(*id))
                .unwrap_or_else(|| "publish pipeline failed".to_string());
            Err(HistoryError::PublishFailed(detail))
        }
    }

    /// Record the outcome of one publish attempt. Success removes the
    /// durable row, unpins the entry's buckets and prunes recorded
    /// history; failure leaves the row for operator-driven retry.
    fn history_published(
        &self,
        ledger: u32,
        original_buckets: &[Hash256],
        success: bool,
    ) -> Result<()> {
        if success {
            self.meters
                .mark(METER_DOMAIN, METER_PUBLISH, Outcome::Success);
            self.queue.dequeue(ledger)?;
            self.with_queue_buckets(|buckets| {
                buckets.remove_buckets(original_buckets);
                Ok(())
            })?;
            self.builder.lock().prune_up_to(ledger);
            info!(ledger, "published checkpoint");
        } else {
            self.meters
                .mark(METER_DOMAIN, METER_PUBLISH, Outcome::Failure);
            warn!(ledger, "checkpoint publication failed");
        }
        Ok(())
    }

    /// Maintain the publish status line: which checkpoints are queued, or
    /// nothing when the queue is empty.
    pub fn log_and_update_publish_status(&self) -> Result<()> {
        let len = self.queue.len()?;
        if len == 0 {
            self.status.remove_status(StatusCategory::HistoryPublish);
        } else {
            let min = self.queue.min_ledger()?.unwrap_or(0);
            let max = self.queue.max_ledger()?.unwrap_or(0);
            self.status.set_status(
                StatusCategory::HistoryPublish,
                format!("publishing {len} queued checkpoints [{min}-{max}]"),
            );
        }
        Ok(())
    }
}
