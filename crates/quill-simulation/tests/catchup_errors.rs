//! Verifier error-path integration tests: corrupted chains, missing and
//! damaged bucket files, and the error kinds and meters they produce.

use std::path::Path;

use quill_common::{Hash256, StatusCategory};
use quill_history::{
    catchup::{CatchupMetrics, METER_DOWNLOAD_HAS},
    paths, HistoryArchiveState, HistoryError, LedgerVerificationStatus,
};
use quill_ledger::{LedgerHeaderHistoryEntry, GENESIS_LEDGER_SEQ};
use quill_simulation::{CatchupSimulation, TestBucketGenerator, TestBucketState};

/// Tamper with a published ledger file so its chain no longer verifies.
fn corrupt_ledger_chain(archive_dir: &Path, checkpoint: u32) {
    let path = archive_dir.join(paths::ledger_path(checkpoint));
    let bytes = quill_common::fs::read_gzipped(&path).unwrap();
    let mut entries: Vec<LedgerHeaderHistoryEntry> = bincode::deserialize(&bytes).unwrap();
    let middle = entries.len() / 2;
    entries[middle].hash = Hash256::hash(b"tampered");
    quill_common::fs::write_gzipped(&path, &bincode::serialize(&entries).unwrap()).unwrap();
}

/// The archive's most recent published state.
fn root_has(archive_dir: &Path) -> HistoryArchiveState {
    let raw = quill_common::fs::read_gzipped(&archive_dir.join(paths::ROOT_HAS_PATH)).unwrap();
    HistoryArchiveState::from_json(&String::from_utf8(raw).unwrap()).unwrap()
}

#[tokio::test]
async fn test_corrupted_oldest_checkpoint_counts_one_chain_failure() {
    let mut sim = CatchupSimulation::new().await;
    let target = sim.checkpoint_ledger(6);
    sim.ensure_offline_catchup_possible(target).await;

    // A recent-window catchup verifies two checkpoints; corrupt the
    // oldest (the last to be verified).
    let oldest = sim.checkpoint_ledger(5);
    corrupt_ledger_chain(sim.archive_dir(), oldest);

    let node = sim.create_catchup_node(8).await;
    assert!(!sim.catchup_offline(&node, target).await);

    let metrics = CatchupMetrics::read(node.meters());
    assert_eq!(metrics.chain_verify_failures, 1);
    // The newer checkpoint verified before the corruption was reached.
    assert_eq!(metrics.ledgers_verified, 8);

    let error = node.take_last_catchup_error().unwrap();
    assert!(matches!(
        error,
        HistoryError::ChainVerificationFailed {
            status: LedgerVerificationStatus::ErrBadHash,
            ..
        }
    ));

    let lm = node.ledger_manager();
    let lm = lm.lock().await;
    assert_eq!(lm.last_closed_seq(), GENESIS_LEDGER_SEQ);
}

#[tokio::test]
async fn test_missing_bucket_file_fails_with_missing_file() {
    let mut sim = CatchupSimulation::new().await;
    let target = sim.checkpoint_ledger(6);
    sim.ensure_offline_catchup_possible(target).await;

    // Remove one bucket the target state references.
    let has = root_has(sim.archive_dir());
    let victim = has.unique_bucket_hashes()[0];
    std::fs::remove_file(sim.archive_dir().join(paths::bucket_path(&victim))).unwrap();

    let node = sim.create_catchup_node(0).await;
    assert!(!sim.catchup_offline(&node, target).await);

    let error = node.take_last_catchup_error().unwrap();
    assert!(matches!(error, HistoryError::MissingFile(_)), "got {error:?}");

    let status = node
        .status()
        .status(StatusCategory::HistoryCatchup)
        .unwrap();
    assert!(status.contains("failed"));

    let lm = node.ledger_manager();
    let lm = lm.lock().await;
    assert_eq!(lm.last_closed_seq(), GENESIS_LEDGER_SEQ);
}

#[tokio::test]
async fn test_corrupted_bucket_gzip_fails_as_corrupted_archive() {
    let mut sim = CatchupSimulation::new().await;
    let target = sim.checkpoint_ledger(6);
    sim.ensure_offline_catchup_possible(target).await;

    let has = root_has(sim.archive_dir());
    let victim = has.unique_bucket_hashes()[0];
    std::fs::write(
        sim.archive_dir().join(paths::bucket_path(&victim)),
        b"not gzip data",
    )
    .unwrap();

    let node = sim.create_catchup_node(0).await;
    assert!(!sim.catchup_offline(&node, target).await);
    let error = node.take_last_catchup_error().unwrap();
    assert!(matches!(error, HistoryError::CorruptedArchive(_)), "got {error:?}");
}

#[tokio::test]
async fn test_bucket_hash_mismatch_fails_verification() {
    let mut sim = CatchupSimulation::new().await;
    let target = sim.checkpoint_ledger(6);
    sim.ensure_offline_catchup_possible(target).await;

    // Replace one referenced bucket's file with another bucket's bytes.
    let has = root_has(sim.archive_dir());
    let hashes = has.unique_bucket_hashes();
    assert!(hashes.len() >= 2);
    let victim = hashes[0];
    let donor = hashes[1];
    std::fs::copy(
        sim.archive_dir().join(paths::bucket_path(&donor)),
        sim.archive_dir().join(paths::bucket_path(&victim)),
    )
    .unwrap();

    let node = sim.create_catchup_node(0).await;
    assert!(!sim.catchup_offline(&node, target).await);
    let error = node.take_last_catchup_error().unwrap();
    assert!(matches!(error, HistoryError::HashMismatch(_)), "got {error:?}");
}

#[tokio::test]
async fn test_generated_bucket_states_through_the_archive() {
    let sim = CatchupSimulation::new().await;
    let mut generator = TestBucketGenerator::new(sim.archive_dir().to_path_buf(), 99, 1);
    let scratch = tempfile::TempDir::new().unwrap();
    let archive = sim.node().archives().readable_archive().unwrap();

    // A well-formed bucket round-trips and verifies.
    let ok = generator.generate_bucket(TestBucketState::ContentsOk).unwrap();
    let bucket = archive.get_bucket(&ok, scratch.path()).await.unwrap();
    assert_eq!(bucket.hash(), ok);

    // A bucket that was never uploaded is a missing file.
    let missing = generator
        .generate_bucket(TestBucketState::FileNotUploaded)
        .unwrap();
    let err = archive.get_bucket(&missing, scratch.path()).await.unwrap_err();
    assert!(matches!(err, HistoryError::MissingFile(_)));

    // A corrupt gzip payload is a corrupted archive object.
    let corrupt = generator
        .generate_bucket(TestBucketState::CorruptedZippedFile)
        .unwrap();
    let err = archive.get_bucket(&corrupt, scratch.path()).await.unwrap_err();
    assert!(matches!(err, HistoryError::CorruptedArchive(_)));

    // A mismatched bucket downloads but fails content verification.
    let claimed = generator
        .generate_bucket(TestBucketState::HashMismatch)
        .unwrap();
    let bucket = archive.get_bucket(&claimed, scratch.path()).await.unwrap();
    assert_ne!(bucket.hash(), claimed);
    assert!(quill_history::verify::verify_bucket_contents(&bucket, &claimed).is_err());
}

#[tokio::test]
async fn test_failed_catchup_performs_no_apply_work() {
    // A failing catchup must not apply anything: only downloads that
    // happened before the failure are visible in the counters.
    let mut sim = CatchupSimulation::new().await;
    sim.ensure_offline_catchup_possible(sim.checkpoint_ledger(2)).await;

    corrupt_ledger_chain(sim.archive_dir(), sim.checkpoint_ledger(2));
    let node = sim.create_catchup_node(u32::MAX).await;
    assert!(!sim.catchup_offline(&node, sim.checkpoint_ledger(2)).await);

    let metrics = CatchupMetrics::read(node.meters());
    assert_eq!(metrics.tx_applied, 0);
    assert_eq!(metrics.buckets_applied, 0);
    assert!(node.meters().count("history", METER_DOWNLOAD_HAS, quill_common::Outcome::Success) >= 1);
}
