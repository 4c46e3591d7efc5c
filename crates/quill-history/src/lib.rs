//! The history subsystem.
//!
//! Publishes hash-chained checkpoints of closed ledger state to external
//! archives and lets a node catch up by downloading, verifying and applying
//! them. The publish side runs off a durable queue written at checkpoint
//! boundaries; the catchup side plans the minimum set of archive objects to
//! fetch, verifies the ledger hash chain end to end, and applies either
//! bucket state or replayed transaction sets.

pub mod archive;
pub mod archive_state;
pub mod catchup;
pub mod checkpoint;
pub mod checkpoint_builder;
mod error;
pub mod manager;
pub mod paths;
pub mod publish;
pub mod publish_queue;
pub mod replay;
pub mod verify;

pub use archive::{Archive, ArchiveConfig, ArchiveManager};
pub use archive_state::{HasBucketLevel, HasBucketNext, HistoryArchiveState};
pub use catchup::{
    compute_catchup_performed_work, plan_catchup, CatchupConfiguration, CatchupManager,
    CatchupMetrics, CatchupMode, CatchupPerformedWork, CatchupPlan, CatchupRunMode,
};
pub use checkpoint::{CheckpointRange, CheckpointScheme, LedgerRange};
pub use checkpoint_builder::{CheckpointBuilder, TransactionHistoryEntry};
pub use error::HistoryError;
pub use manager::{HistoryManager, METER_PUBLISH};
pub use publish_queue::{PublishQueue, PublishQueueBuckets};
pub use verify::LedgerVerificationStatus;

pub use quill_ledger::GENESIS_LEDGER_SEQ;

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Meter domain used by every history counter.
pub const METER_DOMAIN: &str = "history";
