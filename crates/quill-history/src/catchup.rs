//! Catchup planning and the performed-work oracle.
//!
//! Given the local last closed ledger and a target, the planner computes
//! the minimum set of archive objects a catchup must fetch: which
//! checkpoints to verify, whether to jump state by applying buckets, and
//! which ledgers to replay. The oracle derives the exact download/verify/
//! apply counters that executing the plan produces; tests compare observed
//! meters against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use quill_bucket::BucketStore;
use quill_common::{Hash256, MeterRegistry, Outcome, StatusCategory, StatusManager};
use quill_ledger::{LedgerHeaderHistoryEntry, LedgerManager, GENESIS_LEDGER_SEQ};
use tracing::{info, warn};

use crate::{
    archive::ArchiveManager,
    archive_state::HistoryArchiveState,
    checkpoint::{CheckpointRange, CheckpointScheme, LedgerRange},
    replay::{
        DownloadApplyBucketsWork, DownloadVerifyLedgerChainWork, GetArchiveStateWork,
        ReplayLedgerChainWork, SharedCatchup,
    },
    HistoryError, Result, METER_DOMAIN,
};

/// Meter names for the catchup counters.
pub const METER_DOWNLOAD_HAS: &str = "download-history-archive-state";
pub const METER_DOWNLOAD_LEDGER: &str = "download-ledger";
pub const METER_VERIFY_LEDGER: &str = "verify-ledger";
pub const METER_VERIFY_LEDGER_CHAIN: &str = "verify-ledger-chain";
pub const METER_DOWNLOAD_BUCKET: &str = "download-bucket";
pub const METER_BUCKET_APPLY: &str = "bucket-apply";
pub const METER_DOWNLOAD_TRANSACTIONS: &str = "download-transactions";
pub const METER_APPLY_LEDGER_CHAIN: &str = "apply-ledger-chain";

/// How much history a catchup should replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    /// Replay everything from genesis.
    Complete,
    /// Replay the most recent `n` ledgers, jumping state across the gap.
    Recent(u32),
}

impl CatchupMode {
    pub fn count(&self) -> u32 {
        match self {
            CatchupMode::Complete => u32::MAX,
            CatchupMode::Recent(n) => *n,
        }
    }
}

/// Whether the node is offline (operator-driven) or knitting up with a
/// live network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupRunMode {
    Offline,
    Online,
}

/// A catchup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupConfiguration {
    pub to_ledger: u32,
    pub mode: CatchupMode,
    pub run_mode: CatchupRunMode,
}

impl CatchupConfiguration {
    pub fn offline(to_ledger: u32, mode: CatchupMode) -> Self {
        Self {
            to_ledger,
            mode,
            run_mode: CatchupRunMode::Offline,
        }
    }

    pub fn online(to_ledger: u32, mode: CatchupMode) -> Self {
        Self {
            to_ledger,
            mode,
            run_mode: CatchupRunMode::Online,
        }
    }
}

/// The planner's output: what a catchup will fetch, verify and apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupPlan {
    /// The ledger the catchup ends at.
    pub target: u32,
    /// Whether state jumps by installing a checkpoint's buckets.
    pub apply_buckets: bool,
    /// Checkpoint whose buckets are installed; meaningful only when
    /// `apply_buckets`.
    pub bucket_apply_ledger: u32,
    /// Ledgers replayed after any bucket application.
    pub replay: Option<LedgerRange>,
    /// Checkpoints whose header files are downloaded and chain-verified.
    pub verify_checkpoints: CheckpointRange,
    /// Checkpoints whose transaction files are downloaded.
    pub apply_checkpoints: Option<CheckpointRange>,
}

/// Compute the catchup plan.
///
/// The five cases, in order:
/// 1. a node past genesis replays forward from its LCL (no buckets);
/// 2. a replay window covering the whole span replays from genesis;
/// 3. a zero window onto a checkpoint-aligned target installs buckets
///    only;
/// 4. a window starting inside the genesis checkpoint replays from
///    genesis;
/// 5. otherwise buckets are installed at the checkpoint boundary below
///    the window (the window widening down to its checkpoint's first
///    ledger) and the rest is replayed.
pub fn plan_catchup(
    lcl: u32,
    config: &CatchupConfiguration,
    scheme: CheckpointScheme,
) -> Result<CatchupPlan> {
    let target = config.to_ledger;
    if lcl < GENESIS_LEDGER_SEQ || target <= lcl {
        return Err(HistoryError::CatchupFailed(format!(
            "cannot catch up from {lcl} to {target}"
        )));
    }

    let count = config.mode.count();
    let full_replay = target - lcl;

    let (apply_buckets, bucket_apply_ledger, replay) = if lcl > GENESIS_LEDGER_SEQ {
        (false, 0, Some(LedgerRange::new(lcl + 1, target)))
    } else if count >= full_replay {
        (false, 0, Some(LedgerRange::new(GENESIS_LEDGER_SEQ + 1, target)))
    } else if count == 0 && scheme.is_checkpoint_ledger(target) {
        (true, target, None)
    } else {
        let replay_start = target - count + 1;
        let checkpoint = scheme.checkpoint_containing(replay_start);
        let first_in_checkpoint = scheme.first_ledger_of_checkpoint(checkpoint);
        if first_in_checkpoint <= GENESIS_LEDGER_SEQ {
            (false, 0, Some(LedgerRange::new(GENESIS_LEDGER_SEQ + 1, target)))
        } else {
            (
                true,
                first_in_checkpoint - 1,
                Some(LedgerRange::new(first_in_checkpoint, target)),
            )
        }
    };

    let verify_bottom = if apply_buckets {
        bucket_apply_ledger
    } else {
        replay.expect("replay-only plan has a range").first
    };
    let verify_checkpoints =
        CheckpointRange::covering(LedgerRange::new(verify_bottom, target), scheme);
    let apply_checkpoints =
        replay.map(|r| CheckpointRange::covering(LedgerRange::new(r.first, target), scheme));

    Ok(CatchupPlan {
        target,
        apply_buckets,
        bucket_apply_ledger,
        replay,
        verify_checkpoints,
        apply_checkpoints,
    })
}

/// Raw catchup counters, read from the meter registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchupMetrics {
    pub has_downloaded: u64,
    pub ledgers_downloaded: u64,
    pub ledgers_verified: u64,
    pub chain_verify_failures: u64,
    pub buckets_downloaded: u64,
    pub buckets_applied: u64,
    pub tx_downloaded: u64,
    pub tx_applied: u64,
}

impl CatchupMetrics {
    pub fn read(meters: &MeterRegistry) -> Self {
        let success = |name: &str| meters.count(METER_DOMAIN, name, Outcome::Success);
        Self {
            has_downloaded: success(METER_DOWNLOAD_HAS),
            ledgers_downloaded: success(METER_DOWNLOAD_LEDGER),
            ledgers_verified: success(METER_VERIFY_LEDGER),
            chain_verify_failures: meters.count(
                METER_DOMAIN,
                METER_VERIFY_LEDGER_CHAIN,
                Outcome::Failure,
            ),
            buckets_downloaded: success(METER_DOWNLOAD_BUCKET),
            buckets_applied: success(METER_BUCKET_APPLY),
            tx_downloaded: success(METER_DOWNLOAD_TRANSACTIONS),
            tx_applied: success(METER_APPLY_LEDGER_CHAIN),
        }
    }
}

impl std::ops::Sub for CatchupMetrics {
    type Output = CatchupMetrics;

    fn sub(self, rhs: CatchupMetrics) -> CatchupMetrics {
        CatchupMetrics {
            has_downloaded: self.has_downloaded - rhs.has_downloaded,
            ledgers_downloaded: self.ledgers_downloaded - rhs.ledgers_downloaded,
            ledgers_verified: self.ledgers_verified - rhs.ledgers_verified,
            chain_verify_failures: self.chain_verify_failures - rhs.chain_verify_failures,
            buckets_downloaded: self.buckets_downloaded - rhs.buckets_downloaded,
            buckets_applied: self.buckets_applied - rhs.buckets_applied,
            tx_downloaded: self.tx_downloaded - rhs.tx_downloaded,
            tx_applied: self.tx_applied - rhs.tx_applied,
        }
    }
}

/// Boolean-normalised catchup counters: bucket work collapses to "did it
/// happen", everything else stays an exact count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupPerformedWork {
    pub has_downloaded: u64,
    pub ledgers_downloaded: u64,
    pub ledgers_verified: u64,
    pub chain_verify_failures: u64,
    pub buckets_downloaded: bool,
    pub buckets_applied: bool,
    pub tx_downloaded: u64,
    pub tx_applied: u64,
}

impl From<CatchupMetrics> for CatchupPerformedWork {
    fn from(m: CatchupMetrics) -> Self {
        Self {
            has_downloaded: m.has_downloaded,
            ledgers_downloaded: m.ledgers_downloaded,
            ledgers_verified: m.ledgers_verified,
            chain_verify_failures: m.chain_verify_failures,
            buckets_downloaded: m.buckets_downloaded > 0,
            buckets_applied: m.buckets_applied > 0,
            tx_downloaded: m.tx_downloaded,
            tx_applied: m.tx_applied,
        }
    }
}

/// Predict the counters a successful catchup from `lcl` under `config`
/// produces.
///
/// The prediction is derived from the plan's actual ranges, in the same
/// units the executing works use: header and transaction counters count
/// file entries, verification counts every header between the bottom of
/// the verify range and the target.
pub fn compute_catchup_performed_work(
    lcl: u32,
    config: &CatchupConfiguration,
    scheme: CheckpointScheme,
) -> Result<CatchupPerformedWork> {
    let plan = plan_catchup(lcl, config, scheme)?;

    let second_has = plan.apply_buckets
        && plan.bucket_apply_ledger != scheme.checkpoint_containing(plan.target);
    let verify_first_ledger = scheme
        .first_ledger_of_checkpoint(plan.verify_checkpoints.first)
        .max(GENESIS_LEDGER_SEQ);

    Ok(CatchupPerformedWork {
        has_downloaded: 1 + second_has as u64,
        ledgers_downloaded: plan.verify_checkpoints.ledger_entry_count() as u64,
        ledgers_verified: (plan.target - verify_first_ledger + 1) as u64,
        chain_verify_failures: 0,
        buckets_downloaded: plan.apply_buckets,
        buckets_applied: plan.apply_buckets,
        tx_downloaded: plan
            .apply_checkpoints
            .map(|r| r.ledger_entry_count() as u64)
            .unwrap_or(0),
        tx_applied: plan.replay.map(|r| r.count() as u64).unwrap_or(0),
    })
}

/// Shared state of one catchup execution.
pub struct CatchupContext {
    pub plan: CatchupPlan,
    pub scheme: CheckpointScheme,
    pub protocol_version: u32,
    pub archive: Arc<crate::archive::Archive>,
    pub store: BucketStore,
    pub meters: MeterRegistry,
    pub lm: Arc<tokio::sync::Mutex<LedgerManager>>,
    pub lcl_at_start: LedgerHeaderHistoryEntry,
    /// Externally trusted hash of the target ledger, when one is known
    /// (online catchup anchors at the externalized trigger value).
    pub top_anchor: Option<Hash256>,
    pub has_target: Option<HistoryArchiveState>,
    pub has_bucket: Option<HistoryArchiveState>,
    pub verified: BTreeMap<u32, LedgerHeaderHistoryEntry>,
    pub scratch: tempfile::TempDir,
    /// First error encountered, preserved with its kind.
    pub error: Option<HistoryError>,
}

/// Runs catchups against the configured archives.
pub struct CatchupManager {
    archives: Arc<ArchiveManager>,
    store: BucketStore,
    meters: MeterRegistry,
    status: StatusManager,
    scheme: CheckpointScheme,
    protocol_version: u32,
}

impl CatchupManager {
    pub fn new(
        archives: Arc<ArchiveManager>,
        store: BucketStore,
        meters: MeterRegistry,
        status: StatusManager,
        scheme: CheckpointScheme,
        protocol_version: u32,
    ) -> Self {
        Self {
            archives,
            store,
            meters,
            status,
            scheme,
            protocol_version,
        }
    }

    pub fn scheme(&self) -> CheckpointScheme {
        self.scheme
    }

    /// Run a catchup to completion: fetch archive states, download and
    /// verify the ledger chain, install buckets if planned, replay the
    /// rest. On failure the ledger manager is left at its pre-catchup LCL
    /// and the error (with its kind) is returned.
    pub async fn run_catchup(
        &self,
        lm: Arc<tokio::sync::Mutex<LedgerManager>>,
        config: &CatchupConfiguration,
        top_anchor: Option<Hash256>,
    ) -> Result<()> {
        let lcl_at_start = lm.lock().await.last_closed();
        let plan = plan_catchup(lcl_at_start.ledger_seq(), config, self.scheme)?;
        info!(
            lcl = lcl_at_start.ledger_seq(),
            target = plan.target,
            apply_buckets = plan.apply_buckets,
            "starting catchup"
        );
        self.status.set_status(
            StatusCategory::HistoryCatchup,
            format!(
                "catching up to ledger {} from {}",
                plan.target,
                lcl_at_start.ledger_seq()
            ),
        );

        let archive = self.archives.readable_archive()?;
        let scratch = tempfile::TempDir::new()?;
        let ctx: SharedCatchup = Arc::new(tokio::sync::Mutex::new(CatchupContext {
            plan: plan.clone(),
            scheme: self.scheme,
            protocol_version: self.protocol_version,
            archive,
            store: self.store.clone(),
            meters: self.meters.clone(),
            lm,
            lcl_at_start,
            top_anchor,
            has_target: None,
            has_bucket: None,
            verified: BTreeMap::new(),
            scratch,
            error: None,
        }));

        let mut scheduler = quill_work::WorkScheduler::default();
        let mut sequence = quill_work::WorkSequence::new();
        sequence.push(&mut scheduler, Box::new(GetArchiveStateWork::new(ctx.clone())), 1);
        sequence.push(
            &mut scheduler,
            Box::new(DownloadVerifyLedgerChainWork::new(ctx.clone())),
            0,
        );
        // Bucket downloads are idempotent (already-fetched buckets are
        // skipped), so a transient failure may retry once.
        sequence.push(
            &mut scheduler,
            Box::new(DownloadApplyBucketsWork::new(ctx.clone())),
            1,
        );
        sequence.push(
            &mut scheduler,
            Box::new(ReplayLedgerChainWork::new(ctx.clone())),
            0,
        );
        scheduler.run_until_done().await;

        if scheduler.all_succeeded() {
            self.status.set_status(
                StatusCategory::HistoryCatchup,
                format!("caught up to ledger {}", plan.target),
            );
            info!(target = plan.target, "catchup complete");
            Ok(())
        } else {
            let error = ctx
                .lock()
                .await
                .error
                .take()
                .unwrap_or_else(|| HistoryError::CatchupFailed("catchup work failed".to_string()));
            warn!(target = plan.target, error = %error, "catchup failed");
            self.status.set_status(
                StatusCategory::HistoryCatchup,
                format!("catchup to ledger {} failed: {error}", plan.target),
            );
            Err(error)
        }
    }
}
