//! Test harness for the history subsystem.
//!
//! Provides a deterministic ledger generator driving a publishing node, a
//! simulated archive backed by a temp directory, corruption generators for
//! the verifier's error paths, and catchup drivers that compare observed
//! work against the planner's oracle.

mod bucket_gen;
mod chain_gen;
mod configurator;
mod simulation;

pub use bucket_gen::{TestBucketGenerator, TestBucketState};
pub use chain_gen::TestLedgerChainGenerator;
pub use configurator::TmpDirArchiveConfigurator;
pub use simulation::{CatchupSimulation, CAST};

/// Install a compact tracing subscriber honouring `RUST_LOG`. Safe to
/// call from every test; only the first call wins.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
