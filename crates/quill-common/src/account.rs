//! Account ledger entries.
//!
//! The ledger state tracked by this node is a flat map of accounts. Each
//! closed ledger produces a delta of touched account entries; buckets store
//! those deltas, newest version winning on merge.

use serde::{Deserialize, Serialize};

/// Account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Self {
        AccountId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub account_id: AccountId,
    pub balance: i64,
    pub seq_num: u64,
}

impl AccountEntry {
    pub fn new(account_id: AccountId, balance: i64) -> Self {
        Self {
            account_id,
            balance,
            seq_num: 0,
        }
    }
}
