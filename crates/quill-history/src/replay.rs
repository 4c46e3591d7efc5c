//! Catchup execution: the download, verify and apply work units.
//!
//! A catchup is a fixed sequence of four works sharing one
//! [`CatchupContext`]: fetch the archive states, download and verify the
//! ledger header chain (newest checkpoint first, down to the verify
//! bottom), install buckets when the plan jumps state, then replay
//! transaction sets ledger by ledger. Each work records its progress on
//! the shared meters; a failure stores the typed error in the context and
//! blocks the rest of the sequence, leaving the ledger manager at its
//! pre-catchup LCL for everything but a completed bucket apply.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quill_common::{MeterRegistry, Outcome};
use quill_ledger::{LedgerCloseData, LedgerHeaderHistoryEntry};
use quill_work::{Work, WorkContext, WorkOutcome};
use tracing::{debug, info};

use crate::{
    catchup::{
        CatchupContext, METER_APPLY_LEDGER_CHAIN, METER_BUCKET_APPLY, METER_DOWNLOAD_BUCKET,
        METER_DOWNLOAD_HAS, METER_DOWNLOAD_LEDGER, METER_DOWNLOAD_TRANSACTIONS,
        METER_VERIFY_LEDGER, METER_VERIFY_LEDGER_CHAIN,
    },
    verify, HistoryError, METER_DOMAIN,
};

pub type SharedCatchup = Arc<tokio::sync::Mutex<CatchupContext>>;

/// Store `error` in the context and convert it to a work outcome. IO
/// errors are transient and retried; everything else fails the work.
async fn fail(ctx: &SharedCatchup, error: HistoryError) -> WorkOutcome {
    let transient = matches!(error, HistoryError::Io(_));
    let message = error.to_string();
    ctx.lock().await.error = Some(error);
    if transient {
        WorkOutcome::Retry {
            delay: Duration::from_millis(0),
        }
    } else {
        WorkOutcome::Failed(message)
    }
}

/// Fetch the archive state(s) the plan needs: the target checkpoint's
/// HAS, plus the bucket-apply checkpoint's HAS when that is a different
/// checkpoint.
pub struct GetArchiveStateWork {
    ctx: SharedCatchup,
}

impl GetArchiveStateWork {
    pub fn new(ctx: SharedCatchup) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Work for GetArchiveStateWork {
    fn name(&self) -> &str {
        "get-history-archive-state"
    }

    async fn run(&mut self, _wctx: WorkContext) -> WorkOutcome {
        let (plan, scheme, archive, meters, scratch, have_target, have_bucket) = {
            let ctx = self.ctx.lock().await;
            (
                ctx.plan.clone(),
                ctx.scheme,
                ctx.archive.clone(),
                ctx.meters.clone(),
                ctx.scratch.path().to_path_buf(),
                ctx.has_target.is_some(),
                ctx.has_bucket.is_some(),
            )
        };
        let target_checkpoint = scheme.checkpoint_containing(plan.target);

        if !have_target {
            match archive.get_checkpoint_has(target_checkpoint, &scratch).await {
                Ok(has) => {
                    if has.current_ledger != target_checkpoint {
                        return fail(
                            &self.ctx,
                            HistoryError::CorruptedArchive(format!(
                                "archive state at checkpoint {target_checkpoint:#x} claims ledger {}",
                                has.current_ledger
                            )),
                        )
                        .await;
                    }
                    meters.mark(METER_DOMAIN, METER_DOWNLOAD_HAS, Outcome::Success);
                    self.ctx.lock().await.has_target = Some(has);
                }
                Err(e) => {
                    meters.mark(METER_DOMAIN, METER_DOWNLOAD_HAS, Outcome::Failure);
                    return fail(&self.ctx, e).await;
                }
            }
        }

        if plan.apply_buckets && !have_bucket {
            if plan.bucket_apply_ledger == target_checkpoint {
                let mut ctx = self.ctx.lock().await;
                ctx.has_bucket = ctx.has_target.clone();
            } else {
                match archive
                    .get_checkpoint_has(plan.bucket_apply_ledger, &scratch)
                    .await
                {
                    Ok(has) => {
                        meters.mark(METER_DOMAIN, METER_DOWNLOAD_HAS, Outcome::Success);
                        self.ctx.lock().await.has_bucket = Some(has);
                    }
                    Err(e) => {
                        meters.mark(METER_DOMAIN, METER_DOWNLOAD_HAS, Outcome::Failure);
                        return fail(&self.ctx, e).await;
                    }
                }
            }
        }

        WorkOutcome::Success
    }
}

/// Download the verify range's ledger-header files, newest checkpoint
/// first, and verify the chain end to end: inside each file, across
/// checkpoint boundaries, against the trust anchors at both ends.
pub struct DownloadVerifyLedgerChainWork {
    ctx: SharedCatchup,
}

impl DownloadVerifyLedgerChainWork {
    pub fn new(ctx: SharedCatchup) -> Self {
        Self { ctx }
    }

    async fn chain_failed(&self, meters: &MeterRegistry, error: HistoryError) -> WorkOutcome {
        meters.mark(METER_DOMAIN, METER_VERIFY_LEDGER_CHAIN, Outcome::Failure);
        fail(&self.ctx, error).await
    }
}

#[async_trait]
impl Work for DownloadVerifyLedgerChainWork {
    fn name(&self) -> &str {
        "download-verify-ledger-chain"
    }

    async fn run(&mut self, _wctx: WorkContext) -> WorkOutcome {
        let (plan, scheme, protocol, archive, meters, scratch, top_anchor, has_target, has_bucket, lcl) = {
            let ctx = self.ctx.lock().await;
            (
                ctx.plan.clone(),
                ctx.scheme,
                ctx.protocol_version,
                ctx.archive.clone(),
                ctx.meters.clone(),
                ctx.scratch.path().to_path_buf(),
                ctx.top_anchor,
                ctx.has_target.clone(),
                ctx.has_bucket.clone(),
                ctx.lcl_at_start.clone(),
            )
        };

        let target_checkpoint = scheme.checkpoint_containing(plan.target);
        let checkpoints: Vec<u32> = plan.verify_checkpoints.checkpoints().collect();
        let mut verified: BTreeMap<u32, LedgerHeaderHistoryEntry> = BTreeMap::new();
        let mut above_first: Option<LedgerHeaderHistoryEntry> = None;

        for &checkpoint in checkpoints.iter().rev() {
            let mut entries = match archive.get_ledger_headers(checkpoint, &scratch).await {
                Ok(entries) => entries,
                Err(e) => {
                    meters.mark(METER_DOMAIN, METER_DOWNLOAD_LEDGER, Outcome::Failure);
                    return fail(&self.ctx, e).await;
                }
            };
            meters.mark_by(
                METER_DOMAIN,
                METER_DOWNLOAD_LEDGER,
                Outcome::Success,
                entries.len() as u64,
            );
            entries.retain(|e| e.ledger_seq() <= plan.target);

            if let Err(e) =
                verify::verify_checkpoint_headers(&entries, checkpoint, &scheme, plan.target, protocol)
            {
                return self.chain_failed(&meters, e).await;
            }
            if let Some(ref above) = above_first {
                let last = entries.last().expect("verified non-empty");
                if let Err(e) = verify::verify_checkpoint_link(last, above) {
                    return self.chain_failed(&meters, e).await;
                }
            }
            if checkpoint == target_checkpoint {
                if let Some(anchor) = top_anchor {
                    let newest = entries.last().expect("verified non-empty");
                    if newest.hash != anchor {
                        return self
                            .chain_failed(
                                &meters,
                                HistoryError::HashMismatch(format!(
                                    "target ledger {} hash {} does not match externalized value {anchor}",
                                    newest.ledger_seq(),
                                    newest.hash
                                )),
                            )
                            .await;
                    }
                }
            }

            meters.mark_by(
                METER_DOMAIN,
                METER_VERIFY_LEDGER,
                Outcome::Success,
                entries.len() as u64,
            );
            above_first = entries.first().cloned();
            for entry in entries {
                verified.insert(entry.ledger_seq(), entry);
            }
            debug!(checkpoint = format!("{checkpoint:#x}"), "verified checkpoint headers");
        }

        // Anchor the bottom of the chain: a bucket-apply catchup trusts
        // the archive state of the checkpoint it installs, a replay-only
        // catchup connects to the local LCL.
        if plan.apply_buckets {
            let Some(has) = has_bucket else {
                return fail(
                    &self.ctx,
                    HistoryError::CatchupFailed("bucket archive state missing".to_string()),
                )
                .await;
            };
            let anchor_header = verified
                .get(&plan.bucket_apply_ledger)
                .expect("verify range covers the bucket checkpoint");
            if let Err(e) = verify::verify_has_against_header(&has, anchor_header) {
                return self.chain_failed(&meters, e).await;
            }
        } else {
            let bottom: Vec<LedgerHeaderHistoryEntry> = verified.values().cloned().collect();
            if let Err(e) = verify::verify_lcl_anchor(&bottom, &lcl) {
                return self.chain_failed(&meters, e).await;
            }
        }

        // When the target is itself a checkpoint ledger, its archive state
        // must agree with its verified header.
        if plan.target == target_checkpoint {
            let has = has_target.expect("fetched by the previous work");
            let target_header = verified.get(&plan.target).expect("verified");
            if let Err(e) = verify::verify_has_against_header(&has, target_header) {
                return self.chain_failed(&meters, e).await;
            }
        }

        info!(
            first = checkpoints.first().copied().unwrap_or_default(),
            last = checkpoints.last().copied().unwrap_or_default(),
            ledgers = verified.len(),
            "ledger chain verified"
        );
        self.ctx.lock().await.verified = verified;
        WorkOutcome::Success
    }
}

/// Download the buckets of the anchor archive state and install them as
/// the live bucket list, jumping the LCL to the bucket-apply checkpoint.
pub struct DownloadApplyBucketsWork {
    ctx: SharedCatchup,
}

impl DownloadApplyBucketsWork {
    pub fn new(ctx: SharedCatchup) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Work for DownloadApplyBucketsWork {
    fn name(&self) -> &str {
        "download-apply-buckets"
    }

    async fn run(&mut self, _wctx: WorkContext) -> WorkOutcome {
        let (plan, archive, store, meters, scratch, has_bucket, anchor_header, lm) = {
            let ctx = self.ctx.lock().await;
            (
                ctx.plan.clone(),
                ctx.archive.clone(),
                ctx.store.clone(),
                ctx.meters.clone(),
                ctx.scratch.path().to_path_buf(),
                ctx.has_bucket.clone(),
                ctx.verified.get(&ctx.plan.bucket_apply_ledger).cloned(),
                ctx.lm.clone(),
            )
        };
        if !plan.apply_buckets {
            return WorkOutcome::Success;
        }
        let Some(has) = has_bucket else {
            return fail(
                &self.ctx,
                HistoryError::CatchupFailed("bucket archive state missing".to_string()),
            )
            .await;
        };

        let wanted = has.unique_bucket_hashes();
        let missing = store.missing(&wanted);
        for hash in missing {
            let bucket = match archive.get_bucket(&hash, &scratch).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    meters.mark(METER_DOMAIN, METER_DOWNLOAD_BUCKET, Outcome::Failure);
                    return fail(&self.ctx, e).await;
                }
            };
            if let Err(e) = verify::verify_bucket_contents(&bucket, &hash) {
                meters.mark(METER_DOMAIN, METER_DOWNLOAD_BUCKET, Outcome::Failure);
                return fail(&self.ctx, e).await;
            }
            store.put(bucket);
            meters.mark(METER_DOMAIN, METER_DOWNLOAD_BUCKET, Outcome::Success);
        }

        let snapshot = match has.to_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return fail(&self.ctx, e).await,
        };
        let Some(anchor) = anchor_header else {
            return fail(
                &self.ctx,
                HistoryError::CatchupFailed("bucket anchor header not verified".to_string()),
            )
            .await;
        };
        let result = lm
            .lock()
            .await
            .adopt_checkpoint_state(&snapshot, store.clone(), anchor);
        match result {
            Ok(()) => {
                meters.mark(METER_DOMAIN, METER_BUCKET_APPLY, Outcome::Success);
                info!(ledger = plan.bucket_apply_ledger, "bucket state installed");
                WorkOutcome::Success
            }
            Err(e) => {
                meters.mark(METER_DOMAIN, METER_BUCKET_APPLY, Outcome::Failure);
                fail(&self.ctx, e.into()).await
            }
        }
    }
}

/// Replay transaction sets from the apply range's checkpoint files,
/// closing each ledger against the verified header chain.
pub struct ReplayLedgerChainWork {
    ctx: SharedCatchup,
}

impl ReplayLedgerChainWork {
    pub fn new(ctx: SharedCatchup) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Work for ReplayLedgerChainWork {
    fn name(&self) -> &str {
        "replay-ledger-chain"
    }

    async fn run(&mut self, _wctx: WorkContext) -> WorkOutcome {
        let (plan, archive, meters, scratch, verified, lm) = {
            let ctx = self.ctx.lock().await;
            (
                ctx.plan.clone(),
                ctx.archive.clone(),
                ctx.meters.clone(),
                ctx.scratch.path().to_path_buf(),
                ctx.verified.clone(),
                ctx.lm.clone(),
            )
        };
        let (Some(replay), Some(apply_checkpoints)) = (plan.replay, plan.apply_checkpoints) else {
            return WorkOutcome::Success;
        };

        for checkpoint in apply_checkpoints.checkpoints() {
            let entries = match archive.get_transactions(checkpoint, &scratch).await {
                Ok(entries) => entries,
                Err(e) => {
                    meters.mark(METER_DOMAIN, METER_DOWNLOAD_TRANSACTIONS, Outcome::Failure);
                    return fail(&self.ctx, e).await;
                }
            };
            meters.mark_by(
                METER_DOMAIN,
                METER_DOWNLOAD_TRANSACTIONS,
                Outcome::Success,
                entries.len() as u64,
            );

            for entry in entries {
                if !replay.contains(entry.ledger_seq) || entry.ledger_seq > plan.target {
                    continue;
                }
                if let Some(outcome) = self
                    .replay_one(&lm, &meters, &verified, entry.ledger_seq, entry.tx_set)
                    .await
                {
                    return outcome;
                }
            }
        }

        info!(first = replay.first, last = replay.last, "ledger replay complete");
        WorkOutcome::Success
    }
}

impl ReplayLedgerChainWork {
    /// Replay one ledger. Returns `Some(outcome)` on failure.
    async fn replay_one(
        &self,
        lm: &Arc<tokio::sync::Mutex<quill_ledger::LedgerManager>>,
        meters: &MeterRegistry,
        verified: &BTreeMap<u32, LedgerHeaderHistoryEntry>,
        seq: u32,
        tx_set: quill_ledger::TxSet,
    ) -> Option<WorkOutcome> {
        let mut lm = lm.lock().await;
        let lcl = lm.last_closed();
        if seq <= lcl.ledger_seq() {
            return None;
        }
        let Some(expected) = verified.get(&seq) else {
            return Some(
                fail(
                    &self.ctx,
                    HistoryError::CatchupFailed(format!("no verified header for ledger {seq}")),
                )
                .await,
            );
        };
        if tx_set.previous_ledger_hash != lcl.hash {
            meters.mark(METER_DOMAIN, METER_APPLY_LEDGER_CHAIN, Outcome::Failure);
            return Some(
                fail(
                    &self.ctx,
                    HistoryError::HashMismatch(format!(
                        "transaction set for ledger {seq} does not chain onto local ledger {}",
                        lcl.ledger_seq()
                    )),
                )
                .await,
            );
        }
        let close_data = LedgerCloseData::new(seq, tx_set, expected.header.close_time);
        if let Err(e) = lm.close_ledger(&close_data).await {
            meters.mark(METER_DOMAIN, METER_APPLY_LEDGER_CHAIN, Outcome::Failure);
            return Some(fail(&self.ctx, e.into()).await);
        }
        let closed = lm.last_closed();
        if closed.hash != expected.hash {
            meters.mark(METER_DOMAIN, METER_APPLY_LEDGER_CHAIN, Outcome::Failure);
            return Some(
                fail(
                    &self.ctx,
                    HistoryError::HashMismatch(format!(
                        "replayed ledger {seq} hashed to {}, archive records {}",
                        closed.hash, expected.hash
                    )),
                )
                .await,
            );
        }
        meters.mark(METER_DOMAIN, METER_APPLY_LEDGER_CHAIN, Outcome::Success);
        None
    }
}
