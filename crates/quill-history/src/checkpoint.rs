//! Checkpoint arithmetic.
//!
//! History is organized into checkpoints of `F` consecutive ledgers, where
//! `F` is the checkpoint frequency (64 in production, 8 when time is
//! artificially accelerated for testing). A checkpoint is identified by its
//! last ledger, which satisfies `(seq + 1) % F == 0`. The genesis
//! checkpoint is one ledger short: ledger 0 does not exist, ledger 1 is
//! genesis, so with `F = 8` the first checkpoint covers ledgers 1..=7.

use quill_ledger::GENESIS_LEDGER_SEQ;

/// Checkpoint frequency in production.
pub const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 64;

/// Checkpoint frequency under accelerated time.
pub const ACCELERATED_CHECKPOINT_FREQUENCY: u32 = 8;

/// Pure checkpoint arithmetic over a fixed frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointScheme {
    frequency: u32,
}

impl CheckpointScheme {
    pub fn new(frequency: u32) -> Self {
        assert!(frequency >= 2, "checkpoint frequency must be at least 2");
        Self { frequency }
    }

    pub fn production() -> Self {
        Self::new(DEFAULT_CHECKPOINT_FREQUENCY)
    }

    pub fn accelerated() -> Self {
        Self::new(ACCELERATED_CHECKPOINT_FREQUENCY)
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Smallest multiple of the frequency that is >= `ledger`; the
    /// frequency itself for ledger 0.
    pub fn next_checkpoint_ledger(&self, ledger: u32) -> u32 {
        let freq = self.frequency;
        if ledger == 0 {
            return freq;
        }
        ledger.div_ceil(freq) * freq
    }

    /// Largest multiple of the frequency that is <= `ledger`.
    pub fn prev_checkpoint_ledger(&self, ledger: u32) -> u32 {
        (ledger / self.frequency) * self.frequency
    }

    /// Identifier (last ledger) of the checkpoint containing `ledger`.
    pub fn checkpoint_containing(&self, ledger: u32) -> u32 {
        self.next_checkpoint_ledger(ledger + 1) - 1
    }

    /// True when `ledger` is the last ledger of a checkpoint.
    pub fn is_checkpoint_ledger(&self, ledger: u32) -> bool {
        (ledger + 1) % self.frequency == 0
    }

    /// First ledger of the checkpoint identified by `checkpoint`.
    pub fn first_ledger_of_checkpoint(&self, checkpoint: u32) -> u32 {
        debug_assert!(self.is_checkpoint_ledger(checkpoint));
        if checkpoint + 1 == self.frequency {
            GENESIS_LEDGER_SEQ
        } else {
            checkpoint + 1 - self.frequency
        }
    }

    /// Number of ledgers in the checkpoint identified by `checkpoint`;
    /// the genesis checkpoint holds one less than the frequency.
    pub fn checkpoint_entry_count(&self, checkpoint: u32) -> u32 {
        checkpoint - self.first_ledger_of_checkpoint(checkpoint) + 1
    }
}

/// An inclusive range of ledger sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRange {
    pub first: u32,
    pub last: u32,
}

impl LedgerRange {
    pub fn new(first: u32, last: u32) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    pub fn count(&self) -> u32 {
        self.last - self.first + 1
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.first <= seq && seq <= self.last
    }
}

/// An inclusive range of checkpoints, identified by their last ledgers and
/// always aligned to the scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRange {
    pub first: u32,
    pub last: u32,
    scheme: CheckpointScheme,
}

impl CheckpointRange {
    /// Range of checkpoints covering the ledgers `[first, last]`.
    pub fn covering(ledgers: LedgerRange, scheme: CheckpointScheme) -> Self {
        Self {
            first: scheme.checkpoint_containing(ledgers.first),
            last: scheme.checkpoint_containing(ledgers.last),
            scheme,
        }
    }

    pub fn from_checkpoints(first: u32, last: u32, scheme: CheckpointScheme) -> Self {
        debug_assert!(scheme.is_checkpoint_ledger(first));
        debug_assert!(scheme.is_checkpoint_ledger(last));
        debug_assert!(first <= last);
        Self {
            first,
            last,
            scheme,
        }
    }

    /// Number of checkpoints in the range.
    pub fn checkpoint_count(&self) -> u32 {
        (self.last - self.first) / self.scheme.frequency() + 1
    }

    /// Total ledger entries carried by the range's checkpoint files.
    pub fn ledger_entry_count(&self) -> u32 {
        self.last - self.scheme.first_ledger_of_checkpoint(self.first) + 1
    }

    /// Checkpoint identifiers, ascending.
    pub fn checkpoints(&self) -> impl Iterator<Item = u32> + '_ {
        (self.first..=self.last).step_by(self.scheme.frequency() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_checkpoint_ledger() {
        let scheme = CheckpointScheme::accelerated();
        assert_eq!(scheme.next_checkpoint_ledger(0), 8);
        assert_eq!(scheme.next_checkpoint_ledger(1), 8);
        assert_eq!(scheme.next_checkpoint_ledger(8), 8);
        assert_eq!(scheme.next_checkpoint_ledger(9), 16);
        assert_eq!(scheme.next_checkpoint_ledger(33), 40);
    }

    #[test]
    fn test_prev_checkpoint_ledger() {
        let scheme = CheckpointScheme::accelerated();
        assert_eq!(scheme.prev_checkpoint_ledger(0), 0);
        assert_eq!(scheme.prev_checkpoint_ledger(7), 0);
        assert_eq!(scheme.prev_checkpoint_ledger(8), 8);
        assert_eq!(scheme.prev_checkpoint_ledger(15), 8);
        assert_eq!(scheme.prev_checkpoint_ledger(16), 16);
    }

    #[test]
    fn test_checkpoint_containing() {
        let scheme = CheckpointScheme::accelerated();
        for seq in 1..=7 {
            assert_eq!(scheme.checkpoint_containing(seq), 7);
        }
        for seq in 8..=15 {
            assert_eq!(scheme.checkpoint_containing(seq), 15);
        }
        assert_eq!(scheme.checkpoint_containing(40), 47);
    }

    #[test]
    fn test_checkpoint_alignment_invariants() {
        // For all checkpoint-aligned ledgers k*F:
        // next(k*F) == k*F and containing(k*F - 1) == k*F - 1.
        for scheme in [CheckpointScheme::accelerated(), CheckpointScheme::production()] {
            let freq = scheme.frequency();
            for k in 1..6 {
                assert_eq!(scheme.next_checkpoint_ledger(k * freq), k * freq);
                assert_eq!(scheme.checkpoint_containing(k * freq - 1), k * freq - 1);
                assert!(scheme.is_checkpoint_ledger(k * freq - 1));
                assert!(!scheme.is_checkpoint_ledger(k * freq));
            }
        }
    }

    #[test]
    fn test_genesis_checkpoint_is_short() {
        let scheme = CheckpointScheme::accelerated();
        assert_eq!(scheme.first_ledger_of_checkpoint(7), 1);
        assert_eq!(scheme.checkpoint_entry_count(7), 7);
        assert_eq!(scheme.first_ledger_of_checkpoint(15), 8);
        assert_eq!(scheme.checkpoint_entry_count(15), 8);
    }

    #[test]
    fn test_ledger_range() {
        let range = LedgerRange::new(40, 47);
        assert_eq!(range.count(), 8);
        assert!(range.contains(40));
        assert!(range.contains(47));
        assert!(!range.contains(48));
    }

    #[test]
    fn test_checkpoint_range_covering() {
        let scheme = CheckpointScheme::accelerated();
        let range = CheckpointRange::covering(LedgerRange::new(40, 47), scheme);
        assert_eq!(range.first, 47);
        assert_eq!(range.last, 47);
        assert_eq!(range.checkpoint_count(), 1);
        assert_eq!(range.ledger_entry_count(), 8);

        let range = CheckpointRange::covering(LedgerRange::new(39, 47), scheme);
        assert_eq!(range.first, 39);
        assert_eq!(range.checkpoint_count(), 2);
        assert_eq!(range.ledger_entry_count(), 16);

        let range = CheckpointRange::covering(LedgerRange::new(1, 7), scheme);
        assert_eq!(range.checkpoint_count(), 1);
        assert_eq!(range.ledger_entry_count(), 7);
    }

    #[test]
    fn test_checkpoint_iteration() {
        let scheme = CheckpointScheme::accelerated();
        let range = CheckpointRange::from_checkpoints(7, 31, scheme);
        let checkpoints: Vec<u32> = range.checkpoints().collect();
        assert_eq!(checkpoints, vec![7, 15, 23, 31]);
    }
}
