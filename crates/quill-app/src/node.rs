//! The node aggregate.
//!
//! A [`Node`] wires the subsystems together — database, bucket store,
//! ledger manager, history manager, catchup — and owns the policy glue
//! between them: recording closed ledgers into history, queueing
//! checkpoints at boundaries, detecting when buffered externalizations
//! call for an online catchup, and running catchups. Work units receive
//! the pieces they need explicitly; nothing here is global.

use std::sync::Arc;

use parking_lot::Mutex;
use quill_bucket::BucketStore;
use quill_common::{AccountId, Hash256, MeterRegistry, StatusManager, TmpDirManager};
use quill_db::Database;
use quill_history::{
    ArchiveManager, CatchupConfiguration, CatchupManager, CatchupMode, CheckpointScheme,
    HistoryArchiveState, HistoryError, HistoryManager, Result,
};
use quill_ledger::{
    ExternalizeOutcome, LedgerCloseData, LedgerHeaderHistoryEntry, LedgerManager, TxSet,
    GENESIS_LEDGER_SEQ,
};
use tracing::{info, warn};

use crate::Config;

/// Name of the account created at genesis.
pub const ROOT_ACCOUNT: &str = "root";

struct PendingCatchup {
    target: u32,
    top_anchor: Option<Hash256>,
}

/// One running node.
pub struct Node {
    config: Config,
    scheme: CheckpointScheme,
    store: BucketStore,
    meters: MeterRegistry,
    status: StatusManager,
    archives: Arc<ArchiveManager>,
    history: HistoryManager,
    catchup: CatchupManager,
    lm: Arc<tokio::sync::Mutex<LedgerManager>>,
    tmp: TmpDirManager,
    pending_catchup: Mutex<Option<PendingCatchup>>,
    last_catchup_error: Mutex<Option<HistoryError>>,
}

impl Node {
    /// Build a node with a fresh in-memory database.
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open_in_memory()?);
        Self::with_database(config, db)
    }

    /// Build a node on an existing database, e.g. to resume a durable
    /// publish queue after a restart.
    pub fn with_database(config: Config, db: Arc<Database>) -> Result<Self> {
        let scheme = config.checkpoint_scheme();
        let store = BucketStore::new();
        let meters = MeterRegistry::new();
        let status = StatusManager::new();
        let archives = Arc::new(ArchiveManager::new(config.archive_configs()));
        let history = HistoryManager::new(
            db,
            archives.clone(),
            store.clone(),
            meters.clone(),
            status.clone(),
            scheme,
        );
        let catchup = CatchupManager::new(
            archives.clone(),
            store.clone(),
            meters.clone(),
            status.clone(),
            scheme,
            config.ledger_protocol_version,
        );
        let lm = Arc::new(tokio::sync::Mutex::new(LedgerManager::new(
            store.clone(),
            config.ledger_protocol_version,
        )));
        Ok(Self {
            config,
            scheme,
            store,
            meters,
            status,
            archives,
            history,
            catchup,
            lm,
            tmp: TmpDirManager::new()?,
            pending_catchup: Mutex::new(None),
            last_catchup_error: Mutex::new(None),
        })
    }

    /// Create the genesis ledger. When the configuration says not to use
    /// config genesis and a readable archive is available, the node then
    /// jumps to the archive's most recent published state.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut lm = self.lm.lock().await;
            let genesis = lm
                .initialize_genesis(
                    AccountId::new(ROOT_ACCOUNT),
                    self.config.root_account_balance,
                )
                .await?;
            self.history
                .on_ledger_closed(genesis, TxSet::new(Hash256::ZERO));
        }

        if !self.config.use_config_for_genesis {
            if let Ok(archive) = self.archives.readable_archive() {
                let scratch = self.tmp.tmp_dir("root-has-")?;
                let root = archive.get_root_has(scratch.path()).await?;
                if root.current_ledger > GENESIS_LEDGER_SEQ {
                    info!(
                        ledger = root.current_ledger,
                        "deriving starting state from archive"
                    );
                    self.catchup_offline_with_mode(root.current_ledger, CatchupMode::Recent(0))
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheme(&self) -> CheckpointScheme {
        self.scheme
    }

    pub fn meters(&self) -> &MeterRegistry {
        &self.meters
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn archives(&self) -> &ArchiveManager {
        &self.archives
    }

    pub fn ledger_manager(&self) -> Arc<tokio::sync::Mutex<LedgerManager>> {
        self.lm.clone()
    }

    pub fn tmp_dirs(&self) -> &TmpDirManager {
        &self.tmp
    }

    /// Close one ledger directly (the validator path): apply the close
    /// data, record it for history, and queue a checkpoint if this close
    /// landed on a boundary.
    pub async fn close_ledger(&self, close_data: LedgerCloseData) -> Result<LedgerHeaderHistoryEntry> {
        let mut lm = self.lm.lock().await;
        let header = lm.close_ledger(&close_data).await?;
        self.history
            .on_ledger_closed(header.clone(), close_data.tx_set.clone());
        self.history.maybe_queue_checkpoint(&lm)?;
        Ok(header)
    }

    /// Handle an externalized consensus value. In-order values close
    /// directly; out-of-order values are buffered, and once a buffered
    /// ledger reaches the first ledger of a new checkpoint (the trigger)
    /// the node arms an online catchup to the checkpoint below it.
    pub async fn value_externalized(&self, close_data: LedgerCloseData) -> Result<ExternalizeOutcome> {
        let tx_set = close_data.tx_set.clone();
        let mut lm = self.lm.lock().await;
        let outcome = lm.value_externalized(close_data).await?;

        match outcome {
            ExternalizeOutcome::Closed => {
                let header = lm.last_closed();
                self.history.on_ledger_closed(header, tx_set);
                self.history.maybe_queue_checkpoint(&lm)?;
            }
            ExternalizeOutcome::Buffered if lm.is_synced() => {
                let buffered = lm.buffered_seqs();
                let first = *buffered.first().expect("just buffered");
                let trigger = self.scheme.next_checkpoint_ledger(first);
                if buffered.iter().any(|seq| *seq >= trigger) {
                    let top_anchor = lm
                        .buffered_close_data(trigger)
                        .map(|lcd| lcd.tx_set.previous_ledger_hash);
                    lm.start_catchup()?;
                    info!(
                        trigger,
                        target = trigger - 1,
                        "buffered ledgers crossed a checkpoint boundary, arming catchup"
                    );
                    *self.pending_catchup.lock() = Some(PendingCatchup {
                        target: trigger - 1,
                        top_anchor,
                    });
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    pub fn has_pending_catchup(&self) -> bool {
        self.pending_catchup.lock().is_some()
    }

    /// Run the catchup armed by `value_externalized`. On success the
    /// buffer is drained and the node waits for the closing ledger; on
    /// failure the ledger manager returns to its previous LCL.
    pub async fn run_pending_catchup(&self) -> Result<bool> {
        let Some(pending) = self.pending_catchup.lock().take() else {
            return Ok(false);
        };
        let config =
            CatchupConfiguration::online(pending.target, self.config.catchup_mode());
        match self
            .catchup
            .run_catchup(self.lm.clone(), &config, pending.top_anchor)
            .await
        {
            Ok(()) => {
                self.lm.lock().await.finish_catchup_applying().await?;
                Ok(true)
            }
            Err(e) => {
                warn!(target = pending.target, error = %e, "online catchup failed");
                self.lm.lock().await.fail_catchup();
                *self.last_catchup_error.lock() = Some(e);
                Ok(false)
            }
        }
    }

    /// Operator-driven catchup to a target ledger, using the configured
    /// catchup mode. Returns whether the node ended up synced at the
    /// target.
    pub async fn catchup_offline(&self, to_ledger: u32) -> Result<bool> {
        self.catchup_offline_with_mode(to_ledger, self.config.catchup_mode())
            .await
    }

    async fn catchup_offline_with_mode(&self, to_ledger: u32, mode: CatchupMode) -> Result<bool> {
        let config = CatchupConfiguration::offline(to_ledger, mode);
        self.lm.lock().await.start_catchup()?;
        match self.catchup.run_catchup(self.lm.clone(), &config, None).await {
            Ok(()) => {
                self.lm.lock().await.complete_offline_catchup();
                Ok(true)
            }
            Err(e) => {
                warn!(target = to_ledger, error = %e, "offline catchup failed");
                self.lm.lock().await.fail_catchup();
                *self.last_catchup_error.lock() = Some(e);
                Ok(false)
            }
        }
    }

    /// The error that failed the most recent catchup, if any.
    pub fn take_last_catchup_error(&self) -> Option<HistoryError> {
        self.last_catchup_error.lock().take()
    }

    /// Publish queued checkpoints.
    pub async fn publish_queued_history(&self) -> Result<usize> {
        self.history.publish_queued_history().await
    }

    /// Initialize a named archive with this node's current state as the
    /// root state.
    pub async fn initialize_archive(&self, name: &str) -> Result<()> {
        let root_has = {
            let lm = self.lm.lock().await;
            HistoryArchiveState::from_snapshot(
                lm.last_closed_seq(),
                &lm.bucket_list().snapshot(),
                Some("quill".to_string()),
            )
        };
        let scratch = self.tmp.tmp_dir("archive-init-")?;
        self.archives
            .initialize_archive(name, &root_has, scratch.path())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn node() -> Node {
        let node = Node::new(Config::test_default()).unwrap();
        node.initialize().await.unwrap();
        node
    }

    async fn next_close_data(node: &Node, seq_offset: u32) -> LedgerCloseData {
        let lm = node.ledger_manager();
        let lcl = lm.lock().await.last_closed();
        LedgerCloseData::new(
            lcl.ledger_seq() + seq_offset,
            TxSet::new(lcl.hash),
            (lcl.ledger_seq() + seq_offset) as u64 * 10,
        )
    }

    #[tokio::test]
    async fn test_initialize_creates_genesis() {
        let node = node().await;
        let lm = node.ledger_manager();
        let lm = lm.lock().await;
        assert_eq!(lm.last_closed_seq(), GENESIS_LEDGER_SEQ);
        assert!(lm.is_synced());
        assert!(lm.account(&AccountId::new(ROOT_ACCOUNT)).is_some());
    }

    #[tokio::test]
    async fn test_externalize_in_order_closes() {
        let node = node().await;
        let lcd = next_close_data(&node, 1).await;
        let outcome = node.value_externalized(lcd).await.unwrap();
        assert_eq!(outcome, ExternalizeOutcome::Closed);
        assert!(!node.has_pending_catchup());
    }

    #[tokio::test]
    async fn test_buffered_ledger_below_trigger_does_not_arm_catchup() {
        let node = node().await;
        // First buffered ledger is 3; the trigger is the next checkpoint
        // boundary at 8, so nothing arms yet.
        let lcd = next_close_data(&node, 2).await;
        let outcome = node.value_externalized(lcd).await.unwrap();
        assert_eq!(outcome, ExternalizeOutcome::Buffered);
        assert!(!node.has_pending_catchup());
    }

    #[tokio::test]
    async fn test_trigger_ledger_arms_catchup() {
        let node = node().await;
        // Buffer ledgers 3..=8; 8 is the trigger (next checkpoint ledger
        // after 3), so catchup to 7 is armed.
        for seq in 3..=8u32 {
            let lcd = LedgerCloseData::new(seq, TxSet::new(Hash256::hash(b"x")), seq as u64);
            node.value_externalized(lcd).await.unwrap();
        }
        assert!(node.has_pending_catchup());
    }

    #[tokio::test]
    async fn test_no_archive_means_no_queue() {
        let node = node().await;
        for _ in 0..10 {
            let lcd = next_close_data(&node, 1).await;
            node.close_ledger(lcd).await.unwrap();
        }
        assert_eq!(node.history().publish_queue_length().unwrap(), 0);
        assert_eq!(node.history().publish_queued_count(), 0);
    }
}
