//! The checkpoint publish pipeline.
//!
//! Publication of one queued checkpoint runs as a sequence of three works:
//! resolve any bucket merges the snapshotted archive state still had in
//! flight, write the checkpoint's files (archive state, ledger headers,
//! transaction sets, referenced buckets) gzipped into a scoped temp
//! directory, then upload every file to every writable archive, creating
//! remote directories first. A failure in any phase fails the entry and
//! leaves its queue row intact.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use quill_bucket::{Bucket, BucketStore};
use quill_common::fs::write_gzipped;
use quill_ledger::LedgerHeaderHistoryEntry;
use quill_work::{Work, WorkContext, WorkOutcome};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::{
    archive::Archive, archive_state::HistoryArchiveState,
    checkpoint_builder::TransactionHistoryEntry, paths, HistoryError,
};

/// Everything needed to publish one checkpoint.
pub struct StateSnapshot {
    pub checkpoint_ledger: u32,
    pub has: HistoryArchiveState,
    pub headers: Vec<LedgerHeaderHistoryEntry>,
    pub transactions: Vec<TransactionHistoryEntry>,
    /// Staging directory; files live exactly as long as the snapshot.
    pub dir: TempDir,
    /// Written files as (local path, remote path) pairs.
    pub files: Vec<(PathBuf, String)>,
}

pub type SharedSnapshot = Arc<tokio::sync::Mutex<StateSnapshot>>;

/// Force the snapshot's in-flight bucket merges to completion.
///
/// A state queued while a background merge was running records the merge's
/// input hashes. Publication needs stable output hashes, so the merge is
/// recomputed from its inputs (merging is deterministic) and the state
/// rewritten to reference the output.
pub struct ResolveSnapshotWork {
    snapshot: SharedSnapshot,
    store: BucketStore,
}

impl ResolveSnapshotWork {
    pub fn new(snapshot: SharedSnapshot, store: BucketStore) -> Self {
        Self { snapshot, store }
    }
}

#[async_trait]
impl Work for ResolveSnapshotWork {
    fn name(&self) -> &str {
        "resolve-snapshot"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let mut snapshot = self.snapshot.lock().await;
        for level in &mut snapshot.has.current_buckets {
            if level.next.state != 2 {
                continue;
            }
            let load = |hex: &Option<String>| -> Result<Arc<Bucket>, HistoryError> {
                let hex = hex
                    .as_deref()
                    .ok_or_else(|| HistoryError::PublishFailed("merge input missing".into()))?;
                let hash = quill_common::Hash256::from_hex(hex)
                    .map_err(|e| HistoryError::Decode(e.to_string()))?;
                Ok(self.store.get(&hash)?)
            };
            let merged = match (load(&level.next.curr), load(&level.next.snap)) {
                (Ok(older), Ok(newer)) => Bucket::merge(&older, &newer),
                (Err(e), _) | (_, Err(e)) => return WorkOutcome::Failed(e.to_string()),
            };
            let output = self.store.put(merged);
            level.next.state = 1;
            level.next.output = Some(output.to_hex());
            level.next.curr = None;
            level.next.snap = None;
            debug!(output = %output, "resolved pending bucket merge for publication");
        }
        WorkOutcome::Success
    }
}

/// Write the checkpoint's files, gzipped, into the staging directory.
pub struct WriteSnapshotWork {
    snapshot: SharedSnapshot,
    store: BucketStore,
}

impl WriteSnapshotWork {
    pub fn new(snapshot: SharedSnapshot, store: BucketStore) -> Self {
        Self { snapshot, store }
    }

    fn write_file(
        snapshot: &mut StateSnapshot,
        remote: String,
        bytes: &[u8],
    ) -> Result<(), HistoryError> {
        let local = snapshot.dir.path().join(remote.replace('/', "_"));
        write_gzipped(&local, bytes)?;
        snapshot.files.push((local, remote));
        Ok(())
    }
}

#[async_trait]
impl Work for WriteSnapshotWork {
    fn name(&self) -> &str {
        "write-snapshot"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let mut snapshot = self.snapshot.lock().await;
        let checkpoint = snapshot.checkpoint_ledger;
        snapshot.files.clear();

        let has_json = match snapshot.has.to_json() {
            Ok(json) => json,
            Err(e) => return WorkOutcome::Failed(e.to_string()),
        };
        if let Err(e) =
            Self::write_file(&mut snapshot, paths::has_path(checkpoint), has_json.as_bytes())
        {
            return WorkOutcome::Failed(e.to_string());
        }

        let headers = match bincode::serialize(&snapshot.headers) {
            Ok(bytes) => bytes,
            Err(e) => return WorkOutcome::Failed(e.to_string()),
        };
        if let Err(e) = Self::write_file(&mut snapshot, paths::ledger_path(checkpoint), &headers) {
            return WorkOutcome::Failed(e.to_string());
        }

        let transactions = match bincode::serialize(&snapshot.transactions) {
            Ok(bytes) => bytes,
            Err(e) => return WorkOutcome::Failed(e.to_string()),
        };
        if let Err(e) = Self::write_file(
            &mut snapshot,
            paths::transactions_path(checkpoint),
            &transactions,
        ) {
            return WorkOutcome::Failed(e.to_string());
        }

        for hash in snapshot.has.unique_bucket_hashes() {
            let bucket = match self.store.get(&hash) {
                Ok(bucket) => bucket,
                Err(e) => return WorkOutcome::Failed(e.to_string()),
            };
            if let Err(e) =
                Self::write_file(&mut snapshot, paths::bucket_path(&hash), &bucket.to_bytes())
            {
                return WorkOutcome::Failed(e.to_string());
            }
        }

        // The well-known root state advances last, once the checkpoint's
        // files are all in place.
        if let Err(e) = Self::write_file(
            &mut snapshot,
            paths::ROOT_HAS_PATH.to_string(),
            has_json.as_bytes(),
        ) {
            return WorkOutcome::Failed(e.to_string());
        }

        debug!(
            checkpoint = format!("{checkpoint:#x}"),
            files = snapshot.files.len(),
            "wrote checkpoint files"
        );
        WorkOutcome::Success
    }
}

/// Upload the written files to every writable archive, in sequence.
pub struct PutSnapshotFilesWork {
    snapshot: SharedSnapshot,
    archives: Vec<Arc<Archive>>,
}

impl PutSnapshotFilesWork {
    pub fn new(snapshot: SharedSnapshot, archives: Vec<Arc<Archive>>) -> Self {
        Self { snapshot, archives }
    }
}

#[async_trait]
impl Work for PutSnapshotFilesWork {
    fn name(&self) -> &str {
        "put-snapshot-files"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let snapshot = self.snapshot.lock().await;
        if self.archives.is_empty() {
            return WorkOutcome::Failed("no writable archive".to_string());
        }
        for archive in &self.archives {
            for (local, remote) in &snapshot.files {
                if let Err(e) = archive.mkdir(paths::remote_dir(remote)).await {
                    return WorkOutcome::Failed(e.to_string());
                }
                if let Err(e) = archive.put_file(local, remote).await {
                    return WorkOutcome::Failed(e.to_string());
                }
            }
            info!(
                archive = archive.name(),
                checkpoint = format!("{:#x}", snapshot.checkpoint_ledger),
                files = snapshot.files.len(),
                "checkpoint uploaded"
            );
        }
        WorkOutcome::Success
    }
}
