//! Publish-side integration tests: queueing at boundaries, bucket
//! pinning, ordered publication, failure handling and durable restart.

use std::sync::Arc;

use quill_app::{Config, Node};
use quill_common::StatusCategory;
use quill_db::Database;
use quill_history::{paths, ArchiveConfig, HistoryArchiveState};
use quill_ledger::{LedgerCloseData, TxSet};
use quill_simulation::{CatchupSimulation, TmpDirArchiveConfigurator};

#[tokio::test]
async fn test_publish_drains_queue_in_order() {
    let mut sim = CatchupSimulation::new().await;
    let third_checkpoint = sim.checkpoint_ledger(3);
    sim.ensure_ledger_available(third_checkpoint + 1).await;

    let history = sim.node().history();
    assert_eq!(history.publish_queued_count(), 3);
    assert_eq!(history.min_ledger_queued_to_publish().unwrap(), Some(7));
    assert_eq!(
        history.max_ledger_queued_to_publish().unwrap(),
        Some(third_checkpoint)
    );

    // Every bucket referenced by a queued state is pinned while queued.
    let queued = history.snapshot_states().unwrap();
    assert_eq!(queued.len(), 3);
    let referenced = history.referenced_buckets().unwrap();
    for (_, has) in &queued {
        for hash in has.all_bucket_hashes() {
            assert!(referenced.contains(&hash), "bucket {hash} not pinned");
        }
    }

    sim.ensure_publishes_complete().await;
    assert_eq!(history.publish_success_count(), 3);
    assert_eq!(history.publish_failure_count(), 0);
    assert!(history.referenced_buckets().unwrap().is_empty());

    for checkpoint in [7, 15, third_checkpoint] {
        for path in [
            paths::has_path(checkpoint),
            paths::ledger_path(checkpoint),
            paths::transactions_path(checkpoint),
        ] {
            assert!(
                sim.archive_dir().join(&path).exists(),
                "archive missing {path}"
            );
        }
    }
}

#[tokio::test]
async fn test_published_has_roundtrip() {
    let mut sim = CatchupSimulation::new().await;
    sim.ensure_offline_catchup_possible(7).await;

    let raw = quill_common::fs::read_gzipped(&sim.archive_dir().join(paths::has_path(7))).unwrap();
    let has = HistoryArchiveState::from_json(&String::from_utf8(raw).unwrap()).unwrap();
    assert_eq!(has.current_ledger, 7);

    // Re-serialising yields the same state.
    let reparsed = HistoryArchiveState::from_json(&has.to_json().unwrap()).unwrap();
    assert_eq!(has, reparsed);

    // Every bucket the published state references exists in the archive.
    for hash in has.unique_bucket_hashes() {
        assert!(sim.archive_dir().join(paths::bucket_path(&hash)).exists());
    }
}

#[tokio::test]
async fn test_published_ledger_file_roundtrip_verifies() {
    let mut sim = CatchupSimulation::new().await;
    sim.ensure_offline_catchup_possible(15).await;

    for checkpoint in [7u32, 15] {
        let raw =
            quill_common::fs::read_gzipped(&sim.archive_dir().join(paths::ledger_path(checkpoint)))
                .unwrap();
        let entries: Vec<quill_ledger::LedgerHeaderHistoryEntry> =
            bincode::deserialize(&raw).unwrap();
        quill_history::verify::verify_checkpoint_headers(
            &entries,
            checkpoint,
            &sim.scheme(),
            checkpoint,
            1,
        )
        .unwrap();
    }
}

#[tokio::test]
async fn test_publish_status_message_lifecycle() {
    let mut sim = CatchupSimulation::new().await;
    sim.ensure_ledger_available(sim.checkpoint_ledger(1) + 1).await;

    sim.node().history().log_and_update_publish_status().unwrap();
    let status = sim.node().status().status(StatusCategory::HistoryPublish);
    assert!(status.is_some());
    assert!(status.unwrap().contains("1 queued"));

    sim.ensure_publishes_complete().await;
    assert!(sim
        .node()
        .status()
        .status(StatusCategory::HistoryPublish)
        .is_none());
}

#[tokio::test]
async fn test_bucket_collection_respects_pins() {
    let mut sim = CatchupSimulation::new().await;
    sim.ensure_ledger_available(sim.checkpoint_ledger(2) + 1).await;

    // With two checkpoints queued, collection keeps the pinned buckets.
    let history = sim.node().history();
    let referenced = history.referenced_buckets().unwrap();
    assert!(!referenced.is_empty());
    {
        let lm = sim.node().ledger_manager();
        let lm = lm.lock().await;
        history.collect_buckets(&lm).unwrap();
    }
    for hash in &referenced {
        assert!(sim.node().store().contains(hash), "pinned bucket collected");
    }
    assert!(history.missing_buckets().unwrap().is_empty());
}

async fn close_empty_ledgers(node: &Node, count: u32) {
    for _ in 0..count {
        let lcl = {
            let lm = node.ledger_manager();
            let lm = lm.lock().await;
            lm.last_closed()
        };
        let close_data = LedgerCloseData::new(
            lcl.ledger_seq() + 1,
            TxSet::new(lcl.hash),
            (lcl.ledger_seq() + 1) as u64 * 10,
        );
        node.close_ledger(close_data).await.unwrap();
    }
}

#[tokio::test]
async fn test_publish_failure_keeps_queue_row() {
    // An archive whose uploads always fail: mkdir succeeds, put does not.
    let mut config = Config::test_default();
    config.add_archive(
        "broken",
        ArchiveConfig {
            name: String::new(),
            get: None,
            put: Some("false".to_string()),
            mkdir: Some("true".to_string()),
        },
    );
    let node = Node::new(config).unwrap();
    node.initialize().await.unwrap();

    close_empty_ledgers(&node, 7).await;
    let history = node.history();
    assert_eq!(history.publish_queued_count(), 1);

    let result = node.publish_queued_history().await;
    assert!(result.is_err());
    assert_eq!(history.publish_failure_count(), 1);
    assert_eq!(history.publish_success_count(), 0);
    // The row survives for operator-driven retry.
    assert_eq!(history.publish_queue_length().unwrap(), 1);
    let status = node.status().status(StatusCategory::HistoryPublish).unwrap();
    assert!(status.contains("failed"));
}

#[tokio::test]
async fn test_publish_to_multiple_archives() {
    let first = TmpDirArchiveConfigurator::new("archive-one").unwrap();
    let second = TmpDirArchiveConfigurator::new("archive-two").unwrap();
    let mut config = Config::test_default();
    first.configure(&mut config, true);
    second.configure(&mut config, true);

    let node = Node::new(config).unwrap();
    node.initialize().await.unwrap();
    close_empty_ledgers(&node, 7).await;
    assert_eq!(node.history().publish_queued_count(), 1);
    node.publish_queued_history().await.unwrap();

    // Both archives received the full checkpoint.
    for configurator in [&first, &second] {
        for path in [paths::has_path(7), paths::ledger_path(7), paths::transactions_path(7)] {
            assert!(
                configurator.archive_dir().join(&path).exists(),
                "{} missing {path}",
                configurator.name()
            );
        }
    }
    assert_eq!(node.history().publish_success_count(), 1);
}

#[tokio::test]
async fn test_queue_and_pins_survive_restart() {
    let configurator = TmpDirArchiveConfigurator::new("restart-archive").unwrap();
    let db_dir = tempfile::TempDir::new().unwrap();
    let db_path = db_dir.path().join("node.db");

    let expected_buckets = {
        let mut config = Config::test_default();
        configurator.configure(&mut config, true);
        let db = Arc::new(Database::open(&db_path).unwrap());
        let node = Node::with_database(config, db).unwrap();
        node.initialize().await.unwrap();
        close_empty_ledgers(&node, 7).await;

        let history = node.history();
        assert_eq!(history.publish_queue_length().unwrap(), 1);
        history.referenced_buckets().unwrap()
    };
    assert!(!expected_buckets.is_empty());

    // A restarted node rebuilds the pin set from the durable rows before
    // anything can collect buckets.
    let mut config = Config::test_default();
    configurator.configure(&mut config, true);
    let db = Arc::new(Database::open(&db_path).unwrap());
    let node = Node::with_database(config, db).unwrap();
    let restored = node.history().referenced_buckets().unwrap();
    assert_eq!(restored, expected_buckets);
    assert_eq!(node.history().publish_queue_length().unwrap(), 1);
}
