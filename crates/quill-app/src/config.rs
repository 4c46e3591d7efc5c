//! Node configuration.
//!
//! Recognised options, named after the operator-facing keys:
//!
//! | Key | Field |
//! |---|---|
//! | `HISTORY` | `history`: archive name → get/put/mkdir templates |
//! | `CATCHUP_RECENT` | `catchup_recent` (`u32::MAX` means complete) |
//! | `CATCHUP_COMPLETE` | `catchup_complete` |
//! | `ARTIFICIALLY_ACCELERATE_TIME_FOR_TESTING` | `artificially_accelerate_time_for_testing` |
//! | `USE_CONFIG_FOR_GENESIS` | `use_config_for_genesis` |
//! | `LEDGER_PROTOCOL_VERSION` | `ledger_protocol_version` |

use std::collections::BTreeMap;

use quill_history::{ArchiveConfig, CatchupMode, CheckpointScheme};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configured history archives, by name. Command templates use `{0}`
    /// (source) and `{1}` (destination) placeholders.
    pub history: BTreeMap<String, ArchiveConfig>,

    /// Replay window for catchup; `u32::MAX` replays from genesis.
    pub catchup_recent: u32,

    /// Force complete replay regardless of `catchup_recent`.
    pub catchup_complete: bool,

    /// Shrink the checkpoint frequency from 64 to 8 so tests cross
    /// checkpoint boundaries quickly.
    pub artificially_accelerate_time_for_testing: bool,

    /// When false, derive the starting state from an archive's root
    /// state instead of the configured genesis.
    pub use_config_for_genesis: bool,

    /// Protocol version stamped into headers and bucket metadata.
    pub ledger_protocol_version: u32,

    /// Balance of the root account created at genesis.
    pub root_account_balance: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history: BTreeMap::new(),
            catchup_recent: 0,
            catchup_complete: false,
            artificially_accelerate_time_for_testing: false,
            use_config_for_genesis: true,
            ledger_protocol_version: 1,
            root_account_balance: 1_000_000_000_000,
        }
    }
}

impl Config {
    /// Default configuration for tests: accelerated checkpoints, config
    /// genesis, no archives.
    pub fn test_default() -> Self {
        Self {
            artificially_accelerate_time_for_testing: true,
            ..Default::default()
        }
    }

    pub fn checkpoint_scheme(&self) -> CheckpointScheme {
        if self.artificially_accelerate_time_for_testing {
            CheckpointScheme::accelerated()
        } else {
            CheckpointScheme::production()
        }
    }

    pub fn catchup_mode(&self) -> CatchupMode {
        if self.catchup_complete || self.catchup_recent == u32::MAX {
            CatchupMode::Complete
        } else {
            CatchupMode::Recent(self.catchup_recent)
        }
    }

    /// Add a history archive. The name lands in the config's key and the
    /// archive's own `name` field.
    pub fn add_archive(&mut self, name: impl Into<String>, mut archive: ArchiveConfig) {
        let name = name.into();
        archive.name = name.clone();
        self.history.insert(name, archive);
    }

    /// Archive configurations in declaration order.
    pub fn archive_configs(&self) -> Vec<ArchiveConfig> {
        self.history.values().cloned().collect()
    }
}
