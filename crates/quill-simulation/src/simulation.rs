//! The catchup simulation.
//!
//! Drives a publishing node through a deterministic stream of synthetic
//! ledgers, records everything a validator needs (header hashes, bucket
//! hashes, account balances and sequence numbers), and runs catchup nodes
//! against the published archive, asserting that the work they perform
//! matches the planner's oracle exactly.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use quill_app::{Config, Node, ROOT_ACCOUNT};
use quill_common::{AccountId, Hash256};
use quill_history::{
    compute_catchup_performed_work, paths, CatchupConfiguration, CatchupMetrics,
    CatchupPerformedWork, CheckpointScheme, HistoryArchiveState,
};
use quill_ledger::{CatchupState, LedgerCloseData, Operation, Transaction, TxSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::TmpDirArchiveConfigurator;

/// The fixed cast of generated accounts, root first.
pub const CAST: [&str; 4] = [ROOT_ACCOUNT, "alice", "bob", "carol"];

/// Wall-clock budget for one catchup.
const CATCHUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-ledger record of everything the validator checks later.
struct LedgerRecord {
    seq: u32,
    hash: Hash256,
    bucket_list_hash: Hash256,
    bucket0: Hash256,
    bucket2: Hash256,
    balances: BTreeMap<&'static str, i64>,
    seq_nums: BTreeMap<&'static str, u64>,
}

/// A publishing node plus the recorded ledger stream it produced.
pub struct CatchupSimulation {
    configurator: TmpDirArchiveConfigurator,
    node: Node,
    rng: StdRng,
    records: Vec<LedgerRecord>,
    close_datas: Vec<LedgerCloseData>,
}

impl CatchupSimulation {
    /// Create the simulation: one node with a writable temp-dir archive,
    /// initialized and with the archive's root state published.
    pub async fn new() -> Self {
        Self::with_seed(0x5eed).await
    }

    pub async fn with_seed(seed: u64) -> Self {
        crate::init_test_logging();
        let configurator = TmpDirArchiveConfigurator::new("sim-archive").expect("tmp archive");
        let mut config = Config::test_default();
        configurator.configure(&mut config, true);

        let node = Node::new(config).expect("node");
        node.initialize().await.expect("genesis");
        node.initialize_archive(configurator.name())
            .await
            .expect("archive init");

        Self {
            configurator,
            node,
            rng: StdRng::seed_from_u64(seed),
            records: Vec::new(),
            close_datas: Vec::new(),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn scheme(&self) -> CheckpointScheme {
        self.node.scheme()
    }

    pub fn archive_dir(&self) -> &Path {
        self.configurator.archive_dir()
    }

    /// Add the simulation's archive to another node's configuration.
    pub fn configure_archive(&self, config: &mut Config, writable: bool) {
        self.configurator.configure(config, writable);
    }

    /// Close data for ledger `seq`, as generated. The first generated
    /// ledger is 2.
    pub fn close_data_for(&self, seq: u32) -> &LedgerCloseData {
        &self.close_datas[(seq - 2) as usize]
    }

    /// Last ledger of checkpoint number `index` (1-based).
    pub fn checkpoint_ledger(&self, index: u32) -> u32 {
        self.scheme().frequency() * index - 1
    }

    async fn account_seq(&self, name: &str) -> u64 {
        let lm = self.node.ledger_manager();
        let lm = lm.lock().await;
        lm.account(&AccountId::new(name)).map(|a| a.seq_num).unwrap_or(0)
    }

    async fn account_exists(&self, name: &str) -> bool {
        let lm = self.node.ledger_manager();
        let lm = lm.lock().await;
        lm.account(&AccountId::new(name)).is_some()
    }

    /// Generate and close one synthetic ledger.
    ///
    /// The root account creates (first time) or pays each cast member
    /// every ledger; after ledger 4 the cast members randomly pay one
    /// another, seeded so the stream is reproducible.
    pub async fn generate_ledger(&mut self) {
        let lcl = {
            let lm = self.node.ledger_manager();
            let lm = lm.lock().await;
            lm.last_closed()
        };
        let seq = lcl.ledger_seq() + 1;
        let big = 1_000 + seq as i64;
        let small = 100 + seq as i64;

        let mut tx_set = TxSet::new(lcl.hash);
        let mut root_seq = self.account_seq(ROOT_ACCOUNT).await;
        for name in &CAST[1..] {
            root_seq += 1;
            let operation = if self.account_exists(name).await {
                Operation::Payment {
                    destination: AccountId::new(*name),
                    amount: big,
                }
            } else {
                Operation::CreateAccount {
                    destination: AccountId::new(*name),
                    starting_balance: big,
                }
            };
            tx_set.add(Transaction {
                source: AccountId::new(ROOT_ACCOUNT),
                seq_num: root_seq,
                operation,
            });
        }

        if seq > 4 {
            let pairs = [
                ("alice", "bob"),
                ("alice", "carol"),
                ("bob", "alice"),
                ("bob", "carol"),
                ("carol", "alice"),
                ("carol", "bob"),
            ];
            let mut seqs: BTreeMap<&str, u64> = BTreeMap::new();
            for (from, _) in pairs {
                if !seqs.contains_key(from) {
                    let seq = self.account_seq(from).await;
                    seqs.insert(from, seq);
                }
            }
            for (from, to) in pairs {
                if self.rng.gen_bool(0.5) {
                    let next = seqs.get_mut(from).expect("seeded above");
                    *next += 1;
                    tx_set.add(Transaction {
                        source: AccountId::new(from),
                        seq_num: *next,
                        operation: Operation::Payment {
                            destination: AccountId::new(to),
                            amount: small,
                        },
                    });
                }
            }
        }

        let close_data = LedgerCloseData::new(seq, tx_set, 300 * seq as u64);
        self.node
            .close_ledger(close_data.clone())
            .await
            .expect("synthetic ledger closes");
        self.close_datas.push(close_data);
        self.record_ledger().await;
    }

    async fn record_ledger(&mut self) {
        let lm = self.node.ledger_manager();
        let lm = lm.lock().await;
        let lcl = lm.last_closed();

        let mut balances = BTreeMap::new();
        let mut seq_nums = BTreeMap::new();
        for name in CAST {
            let entry = lm.account(&AccountId::new(name));
            balances.insert(name, entry.map(|e| e.balance).unwrap_or(0));
            seq_nums.insert(name, entry.map(|e| e.seq_num).unwrap_or(0));
        }

        self.records.push(LedgerRecord {
            seq: lcl.ledger_seq(),
            hash: lcl.hash,
            bucket_list_hash: lcl.header.bucket_list_hash,
            bucket0: lm.bucket_list().level_curr(0),
            bucket2: lm.bucket_list().level_curr(2),
            balances,
            seq_nums,
        });
    }

    /// Close ledgers until the LCL reaches `target`.
    pub async fn ensure_ledger_available(&mut self, target: u32) {
        loop {
            let lcl = {
                let lm = self.node.ledger_manager();
                let lm = lm.lock().await;
                lm.last_closed_seq()
            };
            if lcl >= target {
                break;
            }
            self.generate_ledger().await;
        }
    }

    /// Drive publication until the queue drains, asserting nothing
    /// failed and every queued checkpoint was published.
    pub async fn ensure_publishes_complete(&self) {
        self.node
            .publish_queued_history()
            .await
            .expect("publication succeeds");
        let history = self.node.history();
        assert_eq!(history.publish_failure_count(), 0);
        assert_eq!(history.publish_success_count(), history.publish_queued_count());
        assert_eq!(history.publish_queue_length().unwrap(), 0);
    }

    /// Make offline catchup to `target` possible: close one ledger past
    /// the containing checkpoint and publish everything.
    pub async fn ensure_offline_catchup_possible(&mut self, target: u32) {
        let checkpoint = self.scheme().checkpoint_containing(target);
        self.ensure_ledger_available(checkpoint + 1).await;
        self.ensure_publishes_complete().await;
    }

    /// Make online catchup around `init_ledger` possible: enough ledgers
    /// for the trigger, the buffer and the closing ledger, all published.
    pub async fn ensure_online_catchup_possible(&mut self, init_ledger: u32, buffer: u32) {
        let checkpoint = self.scheme().checkpoint_containing(init_ledger);
        self.ensure_ledger_available(checkpoint + buffer + 3).await;
        self.ensure_publishes_complete().await;
    }

    /// Create a catchup node reading the simulated archive. `count` is
    /// the replay window; `u32::MAX` means complete replay.
    pub async fn create_catchup_node(&self, count: u32) -> Node {
        let mut config = Config::test_default();
        config.catchup_complete = count == u32::MAX;
        config.catchup_recent = if count == u32::MAX { 0 } else { count };
        self.configurator.configure(&mut config, false);

        let node = Node::new(config).expect("catchup node");
        node.initialize().await.expect("genesis");
        node
    }

    /// Offline catchup driver: run the catchup, and on success assert
    /// the observed counters equal the oracle and the resulting state
    /// matches the recorded stream.
    pub async fn catchup_offline(&self, node: &Node, to_ledger: u32) -> bool {
        info!(to_ledger, "starting offline catchup");
        let start = CatchupMetrics::read(node.meters());
        let lcl = {
            let lm = node.ledger_manager();
            let lm = lm.lock().await;
            lm.last_closed_seq()
        };
        let config = CatchupConfiguration::offline(to_ledger, node.config().catchup_mode());

        let success = tokio::time::timeout(CATCHUP_TIMEOUT, node.catchup_offline(to_ledger))
            .await
            .expect("catchup within its time budget")
            .unwrap_or(false);

        if success {
            {
                let lm = node.ledger_manager();
                let lm = lm.lock().await;
                assert!(lm.is_synced());
                assert_eq!(lm.last_closed_seq(), to_ledger);
            }
            let end = CatchupMetrics::read(node.meters());
            let performed = CatchupPerformedWork::from(end - start);
            let expected =
                compute_catchup_performed_work(lcl, &config, self.scheme()).expect("plan");
            assert_eq!(performed, expected, "observed catchup work vs oracle");
            self.validate_catchup(node).await;
        }
        success
    }

    /// Online catchup driver: externalize `[init_ledger, trigger+buffer]`
    /// to the node (optionally skipping `gap_ledger`), run the armed
    /// catchup, then deliver the closing ledger the node waits for.
    pub async fn catchup_online(
        &self,
        node: &Node,
        init_ledger: u32,
        buffer_ledgers: u32,
        gap_ledger: Option<u32>,
    ) -> bool {
        let start = CatchupMetrics::read(node.meters());
        let lcl_at_start = {
            let lm = node.ledger_manager();
            let lm = lm.lock().await;
            lm.last_closed_seq()
        };
        let trigger = self.scheme().next_checkpoint_ledger(init_ledger);

        for seq in init_ledger..=trigger + buffer_ledgers {
            if gap_ledger == Some(seq) {
                info!(seq, "simulating externalization gap");
                continue;
            }
            let close_data = self.close_data_for(seq).clone();
            node.value_externalized(close_data).await.expect("externalize");
        }

        if !node.has_pending_catchup() {
            return false;
        }
        let ok = tokio::time::timeout(CATCHUP_TIMEOUT, node.run_pending_catchup())
            .await
            .expect("catchup within its time budget")
            .unwrap_or(false);
        if !ok {
            return false;
        }

        // The node applied archive state and drained what it could; it
        // now waits in `WaitingForClosingLedger`. Deliver whatever ledger
        // it needs next: an injected gap inside the buffered window is
        // filled as an ordinary buffered ledger, and the run completes
        // only once the closing ledger — one beyond the whole window —
        // closes.
        let closing = trigger + buffer_ledgers + 1;
        loop {
            let next = {
                let lm = node.ledger_manager();
                let lm = lm.lock().await;
                if lm.is_synced() {
                    break;
                }
                assert_eq!(lm.catchup_state(), CatchupState::WaitingForClosingLedger);
                lm.last_closed_seq() + 1
            };
            assert!(next <= closing, "catchup did not converge on ledger {closing}");
            node.value_externalized(self.close_data_for(next).clone())
                .await
                .expect("closing ledger");
        }

        {
            let lm = node.ledger_manager();
            let lm = lm.lock().await;
            assert!(lm.is_synced());
            assert_eq!(lm.last_closed_seq(), closing);
        }
        let config = CatchupConfiguration::online(trigger - 1, node.config().catchup_mode());
        let end = CatchupMetrics::read(node.meters());
        let performed = CatchupPerformedWork::from(end - start);
        let expected = compute_catchup_performed_work(lcl_at_start, &config, self.scheme())
            .expect("plan");
        assert_eq!(performed, expected, "observed catchup work vs oracle");
        self.validate_catchup(node).await;
        true
    }

    /// Check a caught-up node against the recorded stream: header and
    /// bucket hashes, per-account balances and sequence numbers, and that
    /// the archive still hosts the published buckets.
    pub async fn validate_catchup(&self, node: &Node) {
        let lm = node.ledger_manager();
        let lm = lm.lock().await;
        let lcl = lm.last_closed();
        if lcl.ledger_seq() < 2 {
            return;
        }
        let record = &self.records[(lcl.ledger_seq() - 2) as usize];

        assert_eq!(record.seq, lcl.ledger_seq());
        assert_eq!(record.hash, lcl.hash, "header hash diverged");
        assert_eq!(
            record.bucket_list_hash, lcl.header.bucket_list_hash,
            "bucket list hash diverged"
        );
        assert_eq!(record.bucket0, lm.bucket_list().level_curr(0));
        assert_eq!(record.bucket2, lm.bucket_list().level_curr(2));
        for hash in [record.bucket0, record.bucket2] {
            if !hash.is_zero() {
                assert!(node.store().contains(&hash), "bucket {hash} not in store");
            }
        }

        for name in CAST {
            let entry = lm.account(&AccountId::new(name));
            assert_eq!(
                record.balances[name],
                entry.map(|e| e.balance).unwrap_or(0),
                "balance of {name}"
            );
            assert_eq!(
                record.seq_nums[name],
                entry.map(|e| e.seq_num).unwrap_or(0),
                "sequence number of {name}"
            );
        }

        // The archive must still host every bucket its root state
        // references.
        let root_has_path = self.archive_dir().join(paths::ROOT_HAS_PATH);
        let json = quill_common::fs::read_gzipped(&root_has_path).expect("root state readable");
        let root_has =
            HistoryArchiveState::from_json(&String::from_utf8(json).expect("utf-8 state"))
                .expect("root state parses");
        for hash in root_has.unique_bucket_hashes() {
            assert!(
                self.archive_dir().join(paths::bucket_path(&hash)).exists(),
                "archive lost bucket {hash}"
            );
        }
    }
}
