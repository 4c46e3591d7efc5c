//! Synthetic ledger-header chains for exercising chain verification.

use std::path::PathBuf;

use quill_common::{fs::write_gzipped, Hash256};
use quill_history::{paths, CheckpointRange, CheckpointScheme, LedgerVerificationStatus};
use quill_ledger::{LedgerHeader, LedgerHeaderHistoryEntry};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Writes checkpoint ledger files containing synthetic header chains,
/// optionally corrupted to trigger one verification status. Only the
/// first (oldest, last to be verified) checkpoint of a range carries the
/// corruption; later checkpoints are always well-formed, so a failure is
/// attributable to exactly one file.
pub struct TestLedgerChainGenerator {
    archive_dir: PathBuf,
    scheme: CheckpointScheme,
    rng: StdRng,
}

impl TestLedgerChainGenerator {
    pub fn new(archive_dir: PathBuf, scheme: CheckpointScheme, seed: u64) -> Self {
        Self {
            archive_dir,
            scheme,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn random_hash(&mut self) -> Hash256 {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        Hash256::from_bytes(bytes)
    }

    fn make_entry(&self, seq: u32, prev: Hash256) -> LedgerHeaderHistoryEntry {
        LedgerHeaderHistoryEntry::new(LedgerHeader {
            ledger_seq: seq,
            previous_ledger_hash: prev,
            tx_set_hash: Hash256::ZERO,
            bucket_list_hash: Hash256::ZERO,
            close_time: seq as u64 * 10,
            protocol_version: 1,
        })
    }

    /// Generate the header chain for one checkpoint, chained onto
    /// `prev_hash`, applying `status` as a corruption. Returns the
    /// entries as written (before serialisation).
    pub fn make_one_checkpoint(
        &mut self,
        checkpoint: u32,
        prev_hash: Hash256,
        status: LedgerVerificationStatus,
    ) -> Vec<LedgerHeaderHistoryEntry> {
        let first = self.scheme.first_ledger_of_checkpoint(checkpoint);
        let start = match status {
            // Start a ledger late so the range undershoots.
            LedgerVerificationStatus::ErrUndershot => first + 1,
            _ => first,
        };
        let mut prev = prev_hash;
        let mut entries: Vec<LedgerHeaderHistoryEntry> = (start..=checkpoint)
            .map(|seq| {
                let entry = self.make_entry(seq, prev);
                prev = entry.hash;
                entry
            })
            .collect();

        match status {
            LedgerVerificationStatus::Ok | LedgerVerificationStatus::ErrUndershot => {}
            LedgerVerificationStatus::ErrBadHash => {
                let middle = entries.len() / 2;
                entries[middle].hash = self.random_hash();
            }
            LedgerVerificationStatus::ErrBadLedgerVersion => {
                let middle = entries.len() / 2;
                entries[middle].header.protocol_version = u32::MAX;
                entries[middle].hash = entries[middle].header.compute_hash();
            }
            LedgerVerificationStatus::ErrOvershot => {
                // Prepend an entry from before the checkpoint's range.
                let prev_hash = self.random_hash();
                let extra = self.make_entry(start.saturating_sub(1), prev_hash);
                entries.insert(0, extra);
            }
            LedgerVerificationStatus::ErrMissingEntries => {
                entries.pop();
            }
        }
        entries
    }

    /// Write ledger files for every checkpoint of `range`, corrupting
    /// only the first. Returns the hash of the final (well-formed) entry.
    pub fn make_ledger_chain_files(
        &mut self,
        range: CheckpointRange,
        status: LedgerVerificationStatus,
    ) -> std::io::Result<Hash256> {
        let mut prev = self.random_hash();
        let mut last_hash = prev;
        let checkpoints: Vec<u32> = range.checkpoints().collect();
        for (i, checkpoint) in checkpoints.iter().enumerate() {
            let status = if i == 0 {
                status
            } else {
                LedgerVerificationStatus::Ok
            };
            let entries = self.make_one_checkpoint(*checkpoint, prev, status);
            if let Some(last) = entries.last() {
                prev = last.hash;
                last_hash = last.hash;
            }
            let bytes = bincode::serialize(&entries).expect("header encoding is infallible");
            let path = self.archive_dir.join(paths::ledger_path(*checkpoint));
            write_gzipped(&path, &bytes)?;
        }
        Ok(last_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_history::verify::verify_checkpoint_headers;

    fn generator() -> (tempfile::TempDir, TestLedgerChainGenerator) {
        let dir = tempfile::TempDir::new().unwrap();
        let generator = TestLedgerChainGenerator::new(
            dir.path().to_path_buf(),
            CheckpointScheme::accelerated(),
            42,
        );
        (dir, generator)
    }

    fn status_of(
        entries: &[LedgerHeaderHistoryEntry],
        checkpoint: u32,
    ) -> LedgerVerificationStatus {
        let scheme = CheckpointScheme::accelerated();
        match verify_checkpoint_headers(entries, checkpoint, &scheme, checkpoint, 1) {
            Ok(()) => LedgerVerificationStatus::Ok,
            Err(quill_history::HistoryError::ChainVerificationFailed { status, .. }) => status,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_ok_chain_verifies() {
        let (_dir, mut generator) = generator();
        let entries =
            generator.make_one_checkpoint(15, Hash256::ZERO, LedgerVerificationStatus::Ok);
        assert_eq!(status_of(&entries, 15), LedgerVerificationStatus::Ok);
    }

    #[test]
    fn test_each_corruption_produces_its_status() {
        for status in [
            LedgerVerificationStatus::ErrBadHash,
            LedgerVerificationStatus::ErrBadLedgerVersion,
            LedgerVerificationStatus::ErrOvershot,
            LedgerVerificationStatus::ErrUndershot,
            LedgerVerificationStatus::ErrMissingEntries,
        ] {
            let (_dir, mut generator) = generator();
            let entries = generator.make_one_checkpoint(15, Hash256::ZERO, status);
            assert_eq!(status_of(&entries, 15), status, "for {status:?}");
        }
    }

    #[test]
    fn test_only_first_checkpoint_corrupted() {
        let (_dir, mut generator) = generator();
        let scheme = CheckpointScheme::accelerated();
        let range = CheckpointRange::from_checkpoints(15, 31, scheme);
        generator
            .make_ledger_chain_files(range, LedgerVerificationStatus::ErrBadHash)
            .unwrap();
        // Files exist for every checkpoint in the range.
        for checkpoint in [15u32, 23, 31] {
            assert!(generator
                .archive_dir
                .join(paths::ledger_path(checkpoint))
                .exists());
        }
    }
}
