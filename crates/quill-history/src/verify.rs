//! Verification of downloaded history.
//!
//! Everything fetched from an archive is checked before it is trusted:
//! ledger-header files must form an unbroken hash chain that connects to a
//! trust anchor, buckets must hash to their content address, and an archive
//! state must agree with the verified header of its checkpoint.

use quill_bucket::Bucket;
use quill_common::Hash256;
use quill_ledger::LedgerHeaderHistoryEntry;

use crate::{checkpoint::CheckpointScheme, HistoryError, Result};

/// Outcome classification of ledger chain verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerVerificationStatus {
    Ok,
    /// An entry's hash, or a link between entries, is wrong.
    ErrBadHash,
    /// An entry claims a protocol version newer than this node supports.
    ErrBadLedgerVersion,
    /// The file contains entries past the expected range.
    ErrOvershot,
    /// The file starts after the expected first ledger.
    ErrUndershot,
    /// Entries are missing inside or at the end of the expected range.
    ErrMissingEntries,
}

fn chain_err(status: LedgerVerificationStatus, message: String) -> HistoryError {
    HistoryError::ChainVerificationFailed { status, message }
}

/// Verify the header entries of one checkpoint file.
///
/// `entries` must cover exactly `[first ledger of checkpoint,
/// min(checkpoint, target)]`: consecutive sequence numbers, each entry's
/// stored hash matching its recomputed hash, each entry linking to its
/// predecessor, and no entry claiming a protocol version above
/// `local_protocol`.
pub fn verify_checkpoint_headers(
    entries: &[LedgerHeaderHistoryEntry],
    checkpoint: u32,
    scheme: &CheckpointScheme,
    target: u32,
    local_protocol: u32,
) -> Result<()> {
    let first_expected = scheme.first_ledger_of_checkpoint(checkpoint);
    let last_expected = checkpoint.min(target);

    let Some(first) = entries.first() else {
        return Err(chain_err(
            LedgerVerificationStatus::ErrMissingEntries,
            format!("checkpoint {checkpoint:#x} file is empty"),
        ));
    };
    if first.ledger_seq() > first_expected {
        return Err(chain_err(
            LedgerVerificationStatus::ErrUndershot,
            format!(
                "checkpoint {checkpoint:#x} starts at {} instead of {first_expected}",
                first.ledger_seq()
            ),
        ));
    }
    if first.ledger_seq() < first_expected {
        return Err(chain_err(
            LedgerVerificationStatus::ErrOvershot,
            format!(
                "checkpoint {checkpoint:#x} reaches back to {} before {first_expected}",
                first.ledger_seq()
            ),
        ));
    }

    let last = entries.last().expect("non-empty");
    if last.ledger_seq() > last_expected {
        return Err(chain_err(
            LedgerVerificationStatus::ErrOvershot,
            format!(
                "checkpoint {checkpoint:#x} runs to {} past {last_expected}",
                last.ledger_seq()
            ),
        ));
    }
    if last.ledger_seq() < last_expected {
        return Err(chain_err(
            LedgerVerificationStatus::ErrMissingEntries,
            format!(
                "checkpoint {checkpoint:#x} ends at {} short of {last_expected}",
                last.ledger_seq()
            ),
        ));
    }

    for (i, entry) in entries.iter().enumerate() {
        if entry.header.protocol_version > local_protocol {
            return Err(chain_err(
                LedgerVerificationStatus::ErrBadLedgerVersion,
                format!(
                    "ledger {} has protocol {} above supported {local_protocol}",
                    entry.ledger_seq(),
                    entry.header.protocol_version
                ),
            ));
        }
        if entry.header.compute_hash() != entry.hash {
            return Err(chain_err(
                LedgerVerificationStatus::ErrBadHash,
                format!("ledger {} hash does not match its header", entry.ledger_seq()),
            ));
        }
        if i > 0 {
            let prev = &entries[i - 1];
            if entry.ledger_seq() != prev.ledger_seq() + 1 {
                return Err(chain_err(
                    LedgerVerificationStatus::ErrMissingEntries,
                    format!(
                        "ledger {} follows {} in checkpoint {checkpoint:#x}",
                        entry.ledger_seq(),
                        prev.ledger_seq()
                    ),
                ));
            }
            if entry.header.previous_ledger_hash != prev.hash {
                return Err(chain_err(
                    LedgerVerificationStatus::ErrBadHash,
                    format!("broken chain link into ledger {}", entry.ledger_seq()),
                ));
            }
        }
    }
    Ok(())
}

/// Verify the link between two adjacent checkpoints: the later file's
/// first entry must chain onto the earlier file's last entry.
pub fn verify_checkpoint_link(
    earlier_last: &LedgerHeaderHistoryEntry,
    later_first: &LedgerHeaderHistoryEntry,
) -> Result<()> {
    if later_first.ledger_seq() != earlier_last.ledger_seq() + 1 {
        return Err(chain_err(
            LedgerVerificationStatus::ErrMissingEntries,
            format!(
                "checkpoint boundary gap: {} then {}",
                earlier_last.ledger_seq(),
                later_first.ledger_seq()
            ),
        ));
    }
    if later_first.header.previous_ledger_hash != earlier_last.hash {
        return Err(chain_err(
            LedgerVerificationStatus::ErrBadHash,
            format!(
                "broken chain across checkpoint boundary at ledger {}",
                later_first.ledger_seq()
            ),
        ));
    }
    Ok(())
}

/// Verify that a downloaded chain connects to the local last closed
/// ledger: the entry at the LCL's sequence (if present) must carry the
/// LCL's hash, and the entry just above it must link to it.
pub fn verify_lcl_anchor(
    entries: &[LedgerHeaderHistoryEntry],
    lcl: &LedgerHeaderHistoryEntry,
) -> Result<()> {
    for entry in entries {
        if entry.ledger_seq() == lcl.ledger_seq() && entry.hash != lcl.hash {
            return Err(chain_err(
                LedgerVerificationStatus::ErrBadHash,
                format!(
                    "archive disagrees with local ledger {}; local state diverged",
                    lcl.ledger_seq()
                ),
            ));
        }
        if entry.ledger_seq() == lcl.ledger_seq() + 1
            && entry.header.previous_ledger_hash != lcl.hash
        {
            return Err(chain_err(
                LedgerVerificationStatus::ErrBadHash,
                format!(
                    "archive chain does not connect to local ledger {}",
                    lcl.ledger_seq()
                ),
            ));
        }
    }
    Ok(())
}

/// Verify that a bucket's content matches its advertised hash.
pub fn verify_bucket_contents(bucket: &Bucket, expected: &Hash256) -> Result<()> {
    let actual = bucket.hash();
    if actual != *expected {
        return Err(HistoryError::HashMismatch(format!(
            "bucket expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// Verify an archive state against the verified header of its checkpoint:
/// the bucket list the state describes must hash to what the header
/// recorded.
pub fn verify_has_against_header(
    has: &crate::archive_state::HistoryArchiveState,
    header: &LedgerHeaderHistoryEntry,
) -> Result<()> {
    debug_assert_eq!(has.current_ledger, header.ledger_seq());
    let from_has = has.bucket_list_hash()?;
    let from_header = header.header.bucket_list_hash;
    if from_has != from_header {
        return Err(HistoryError::HashMismatch(format!(
            "archive state at {} claims bucket list {from_has}, header records {from_header}",
            has.current_ledger
        )));
    }
    Ok(())
}
