//! The ledger manager state machine.
//!
//! Owns the account state, the live bucket list and the last closed ledger
//! (LCL). Closing is strictly sequential: close data must carry the next
//! sequence number and chain onto the LCL hash. While out of sync the
//! manager buffers externalized ledgers; catchup installs archive state
//! underneath them and the buffer is drained once it becomes contiguous
//! with the LCL again.

use std::collections::{BTreeMap, HashMap};

use quill_bucket::{BucketLevelSnapshot, BucketList, BucketStore};
use quill_common::{AccountEntry, AccountId, Hash256};
use tracing::{debug, info, warn};

use crate::{
    LedgerCloseData, LedgerError, LedgerHeader, LedgerHeaderHistoryEntry, Operation, Result,
    Transaction,
};

/// Sequence number of the genesis ledger. Ledger 0 does not exist.
pub const GENESIS_LEDGER_SEQ: u32 = 1;

/// Coarse state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerManagerState {
    /// Created but not yet initialized with a genesis ledger.
    Booting,
    /// LCL tracks the network; externalized ledgers close directly.
    Synced,
    /// A catchup is installing archive state.
    CatchingUp,
}

/// Sub-state while catching up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupState {
    None,
    /// Archive data is being verified and applied.
    Applying,
    /// Archive data applied and the buffer drained; waiting for the next
    /// externalized ledger to close normally and declare the node synced.
    WaitingForClosingLedger,
}

/// What `value_externalized` did with a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalizeOutcome {
    /// Closed directly on top of the LCL.
    Closed,
    /// Stored in the out-of-sync buffer.
    Buffered,
    /// Older than the LCL; dropped.
    Ignored,
}

/// The ledger manager.
pub struct LedgerManager {
    state: LedgerManagerState,
    catchup_state: CatchupState,
    accounts: HashMap<AccountId, AccountEntry>,
    bucket_list: BucketList,
    lcl: Option<LedgerHeaderHistoryEntry>,
    buffered: BTreeMap<u32, LedgerCloseData>,
    protocol_version: u32,
}

impl LedgerManager {
    pub fn new(store: BucketStore, protocol_version: u32) -> Self {
        Self {
            state: LedgerManagerState::Booting,
            catchup_state: CatchupState::None,
            accounts: HashMap::new(),
            bucket_list: BucketList::new(store, protocol_version),
            lcl: None,
            buffered: BTreeMap::new(),
            protocol_version,
        }
    }

    /// Create the genesis ledger: a single root account and an empty
    /// transaction set at sequence [`GENESIS_LEDGER_SEQ`].
    pub async fn initialize_genesis(
        &mut self,
        root: AccountId,
        root_balance: i64,
    ) -> Result<LedgerHeaderHistoryEntry> {
        if self.state != LedgerManagerState::Booting {
            return Err(LedgerError::InvalidState(
                "genesis requires a booting manager".to_string(),
            ));
        }
        let entry = AccountEntry::new(root.clone(), root_balance);
        self.accounts.insert(root, entry.clone());
        self.bucket_list
            .add_batch(GENESIS_LEDGER_SEQ, vec![entry])
            .await?;

        let header = LedgerHeader {
            ledger_seq: GENESIS_LEDGER_SEQ,
            previous_ledger_hash: Hash256::ZERO,
            tx_set_hash: Hash256::ZERO,
            bucket_list_hash: self.bucket_list.hash(),
            close_time: 0,
            protocol_version: self.protocol_version,
        };
        let lhhe = LedgerHeaderHistoryEntry::new(header);
        self.lcl = Some(lhhe.clone());
        self.state = LedgerManagerState::Synced;
        info!(hash = %lhhe.hash, "initialized genesis ledger");
        Ok(lhhe)
    }

    pub fn state(&self) -> LedgerManagerState {
        self.state
    }

    pub fn catchup_state(&self) -> CatchupState {
        self.catchup_state
    }

    pub fn is_synced(&self) -> bool {
        self.state == LedgerManagerState::Synced
    }

    /// The last closed ledger. Panics only if called before genesis.
    pub fn last_closed(&self) -> LedgerHeaderHistoryEntry {
        self.lcl.clone().expect("ledger manager is initialized")
    }

    pub fn last_closed_seq(&self) -> u32 {
        self.lcl.as_ref().map(|l| l.ledger_seq()).unwrap_or(0)
    }

    pub fn account(&self, id: &AccountId) -> Option<&AccountEntry> {
        self.accounts.get(id)
    }

    pub fn bucket_list(&self) -> &BucketList {
        &self.bucket_list
    }

    pub fn bucket_list_mut(&mut self) -> &mut BucketList {
        &mut self.bucket_list
    }

    pub fn buffered_seqs(&self) -> Vec<u32> {
        self.buffered.keys().copied().collect()
    }

    pub fn buffered_close_data(&self, seq: u32) -> Option<&LedgerCloseData> {
        self.buffered.get(&seq)
    }

    /// Close one ledger on top of the LCL.
    ///
    /// Valid while synced (normal operation) and while catching up
    /// (transaction replay). The close data must carry `LCL + 1` and its
    /// transaction set must chain onto the LCL hash.
    pub async fn close_ledger(
        &mut self,
        close_data: &LedgerCloseData,
    ) -> Result<LedgerHeaderHistoryEntry> {
        let lcl = self.last_closed();
        let expected = lcl.ledger_seq() + 1;
        if close_data.ledger_seq != expected {
            return Err(LedgerError::UnexpectedSequence {
                expected,
                got: close_data.ledger_seq,
            });
        }
        if close_data.tx_set.previous_ledger_hash != lcl.hash {
            return Err(LedgerError::PreviousHashMismatch {
                ledger: close_data.ledger_seq,
                expected: lcl.hash,
                got: close_data.tx_set.previous_ledger_hash,
            });
        }

        let mut touched: Vec<AccountId> = Vec::new();
        for tx in &close_data.tx_set.txs {
            if self.apply_transaction(tx) {
                touched.push(tx.source.clone());
                match &tx.operation {
                    Operation::CreateAccount { destination, .. }
                    | Operation::Payment { destination, .. } => touched.push(destination.clone()),
                }
            }
        }
        touched.sort();
        touched.dedup();
        let delta: Vec<AccountEntry> = touched
            .iter()
            .filter_map(|id| self.accounts.get(id).cloned())
            .collect();
        self.bucket_list
            .add_batch(close_data.ledger_seq, delta)
            .await?;

        let header = LedgerHeader {
            ledger_seq: close_data.ledger_seq,
            previous_ledger_hash: lcl.hash,
            tx_set_hash: close_data.tx_set.contents_hash(),
            bucket_list_hash: self.bucket_list.hash(),
            close_time: close_data.close_time,
            protocol_version: self.protocol_version,
        };
        let lhhe = LedgerHeaderHistoryEntry::new(header);
        debug!(
            ledger_seq = close_data.ledger_seq,
            txs = close_data.tx_set.len(),
            hash = %lhhe.hash,
            "closed ledger"
        );
        self.lcl = Some(lhhe.clone());
        Ok(lhhe)
    }

    /// Apply one transaction, returning whether it was valid. Invalid
    /// transactions (bad sequence number, unknown source, overdraw,
    /// duplicate create) are skipped without touching state.
    fn apply_transaction(&mut self, tx: &Transaction) -> bool {
        let Some(source) = self.accounts.get(&tx.source) else {
            warn!(source = %tx.source, "transaction from unknown account");
            return false;
        };
        if tx.seq_num != source.seq_num + 1 {
            return false;
        }
        match &tx.operation {
            Operation::CreateAccount {
                destination,
                starting_balance,
            } => {
                if self.accounts.contains_key(destination) || *starting_balance < 0 {
                    return false;
                }
                if source.balance < *starting_balance {
                    return false;
                }
                let source = self.accounts.get_mut(&tx.source).expect("checked above");
                source.balance -= starting_balance;
                source.seq_num += 1;
                let entry = AccountEntry::new(destination.clone(), *starting_balance);
                self.accounts.insert(destination.clone(), entry);
                true
            }
            Operation::Payment {
                destination,
                amount,
            } => {
                if *amount < 0
                    || !self.accounts.contains_key(destination)
                    || destination == &tx.source
                    || source.balance < *amount
                {
                    return false;
                }
                let source = self.accounts.get_mut(&tx.source).expect("checked above");
                source.balance -= amount;
                source.seq_num += 1;
                self.accounts.get_mut(destination).expect("checked above").balance += amount;
                true
            }
        }
    }

    /// Handle a consensus value for `close_data.ledger_seq`.
    pub async fn value_externalized(
        &mut self,
        close_data: LedgerCloseData,
    ) -> Result<ExternalizeOutcome> {
        let seq = close_data.ledger_seq;
        if seq <= self.last_closed_seq() {
            return Ok(ExternalizeOutcome::Ignored);
        }

        match (self.state, self.catchup_state) {
            (LedgerManagerState::Synced, _) if seq == self.last_closed_seq() + 1 => {
                self.close_ledger(&close_data).await?;
                Ok(ExternalizeOutcome::Closed)
            }
            (LedgerManagerState::CatchingUp, CatchupState::WaitingForClosingLedger)
                if seq == self.last_closed_seq() + 1 =>
            {
                // A ledger with buffered successors merely fills a hole in
                // the buffered window; the closing ledger is one strictly
                // beyond everything already buffered.
                let fills_gap = self.buffered.keys().any(|buffered| *buffered > seq);
                self.close_ledger(&close_data).await?;
                self.drain_buffered().await?;
                if fills_gap {
                    debug!(
                        lcl = self.last_closed_seq(),
                        "buffered gap filled, still waiting for closing ledger"
                    );
                } else {
                    self.catchup_state = CatchupState::None;
                    self.state = LedgerManagerState::Synced;
                    info!(lcl = self.last_closed_seq(), "closing ledger received, catchup complete");
                }
                Ok(ExternalizeOutcome::Closed)
            }
            _ => {
                self.buffered.insert(seq, close_data);
                Ok(ExternalizeOutcome::Buffered)
            }
        }
    }

    /// Enter catchup. Buffered ledgers are retained; they knit up with the
    /// archive state once it is installed.
    pub fn start_catchup(&mut self) -> Result<()> {
        if self.state == LedgerManagerState::Booting {
            return Err(LedgerError::InvalidState(
                "cannot catch up before genesis".to_string(),
            ));
        }
        self.state = LedgerManagerState::CatchingUp;
        self.catchup_state = CatchupState::Applying;
        Ok(())
    }

    /// Install a verified checkpoint state wholesale: bucket list levels,
    /// the account state they encode, and the LCL header. This is the
    /// atomic state jump of a bucket-apply catchup.
    pub fn adopt_checkpoint_state(
        &mut self,
        snapshot: &[BucketLevelSnapshot],
        store: BucketStore,
        lcl: LedgerHeaderHistoryEntry,
    ) -> Result<()> {
        if self.state != LedgerManagerState::CatchingUp {
            return Err(LedgerError::InvalidState(
                "bucket apply requires an active catchup".to_string(),
            ));
        }
        let bucket_list = BucketList::restore(store, self.protocol_version, snapshot)?;
        let entries = bucket_list.full_account_state()?;
        self.accounts = entries
            .into_iter()
            .map(|e| (e.account_id.clone(), e))
            .collect();
        self.bucket_list = bucket_list;
        info!(lcl = lcl.ledger_seq(), "adopted checkpoint state");
        self.lcl = Some(lcl);
        Ok(())
    }

    /// Close buffered ledgers while they are contiguous with the LCL.
    pub async fn drain_buffered(&mut self) -> Result<u32> {
        let mut applied = 0;
        loop {
            let next = self.last_closed_seq() + 1;
            // Anything at or below the LCL is stale.
            self.buffered = self.buffered.split_off(&next);
            let Some(close_data) = self.buffered.remove(&next) else {
                break;
            };
            self.close_ledger(&close_data).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Archive apply finished; drain the contiguous part of the buffer
    /// and wait for the closing ledger.
    ///
    /// Ledgers still buffered beyond a hole are not discarded: the hole
    /// is filled by an ordinary later externalization, and the closing
    /// ledger — the one that ends the catchup — is always one strictly
    /// beyond the maximum already-buffered ledger.
    pub async fn finish_catchup_applying(&mut self) -> Result<()> {
        if self.state != LedgerManagerState::CatchingUp {
            return Err(LedgerError::InvalidState(
                "not catching up".to_string(),
            ));
        }
        self.drain_buffered().await?;
        self.catchup_state = CatchupState::WaitingForClosingLedger;
        Ok(())
    }

    /// Offline catchup finished; the node is synced at the target.
    pub fn complete_offline_catchup(&mut self) {
        self.buffered.clear();
        self.catchup_state = CatchupState::None;
        self.state = LedgerManagerState::Synced;
    }

    /// Catchup failed; return to synced operation at the old LCL.
    pub fn fail_catchup(&mut self) {
        self.catchup_state = CatchupState::None;
        self.state = LedgerManagerState::Synced;
    }
}
