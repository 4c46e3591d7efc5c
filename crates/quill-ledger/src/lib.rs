//! Ledger state: headers, transaction sets and the ledger manager.

mod error;
mod header;
mod manager;
mod tx;

pub use error::LedgerError;
pub use header::{LedgerHeader, LedgerHeaderHistoryEntry};
pub use manager::{
    CatchupState, ExternalizeOutcome, LedgerManager, LedgerManagerState, GENESIS_LEDGER_SEQ,
};
pub use tx::{LedgerCloseData, Operation, Transaction, TxSet};

pub type Result<T> = std::result::Result<T, LedgerError>;
