//! Archive path layout.
//!
//! Files are sharded across directories by the first three bytes of the
//! hex-encoded checkpoint ledger (or bucket hash):
//!
//! ```text
//! history/00/00/00/history-0000002f.json.gz
//! ledger/00/00/00/ledger-0000002f.xdr.gz
//! transactions/00/00/00/transactions-0000002f.xdr.gz
//! bucket/e1/13/f8/bucket-e113f8cc....xdr.gz
//! ```
//!
//! The verifier depends on this layout; it is stable.

use quill_common::Hash256;

/// Well-known location of an archive's most recent state file.
pub const ROOT_HAS_PATH: &str = ".well-known/history.json.gz";

/// Path of a checkpoint file of the given category.
pub fn checkpoint_path(category: &str, checkpoint: u32, ext: &str) -> String {
    let hex = format!("{:08x}", checkpoint);
    format!(
        "{}/{}/{}/{}/{}-{}.{}",
        category,
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        category,
        hex,
        ext
    )
}

/// Path of the archive state file for a checkpoint.
pub fn has_path(checkpoint: u32) -> String {
    checkpoint_path("history", checkpoint, "json.gz")
}

/// Path of the ledger-header file for a checkpoint.
pub fn ledger_path(checkpoint: u32) -> String {
    checkpoint_path("ledger", checkpoint, "xdr.gz")
}

/// Path of the transaction file for a checkpoint.
pub fn transactions_path(checkpoint: u32) -> String {
    checkpoint_path("transactions", checkpoint, "xdr.gz")
}

/// Path of a content-addressed bucket file.
pub fn bucket_path(hash: &Hash256) -> String {
    let hex = hash.to_hex();
    format!(
        "bucket/{}/{}/{}/bucket-{}.xdr.gz",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        hex
    )
}

/// Remote directory holding `path`.
pub fn remote_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}
