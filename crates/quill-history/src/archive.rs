//! History archives driven by configurable shell commands.
//!
//! An archive is defined by three command templates with positional
//! placeholders `{0}` (source) and `{1}` (destination):
//!
//! ```toml
//! [history.archives.local]
//! get = "cp /mnt/archive/{0} {1}"
//! put = "cp {0} /mnt/archive/{1}"
//! mkdir = "mkdir -p /mnt/archive/{0}"
//! ```
//!
//! The same mechanism covers local directories, object stores behind a CLI,
//! and the simulated archives used by tests. An archive with no `put`
//! command is read-only; the node only queues checkpoints when at least one
//! writable archive is configured.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use quill_bucket::Bucket;
use quill_common::{gunzip_bytes, Hash256};
use quill_ledger::LedgerHeaderHistoryEntry;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    archive_state::HistoryArchiveState, checkpoint_builder::TransactionHistoryEntry, paths,
    HistoryError, Result,
};

/// Configuration of one archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub name: String,
    /// Download template; `{0}` remote path, `{1}` local path.
    #[serde(default)]
    pub get: Option<String>,
    /// Upload template; `{0}` local path, `{1}` remote path.
    #[serde(default)]
    pub put: Option<String>,
    /// Remote directory creation template; `{0}` remote directory.
    #[serde(default)]
    pub mkdir: Option<String>,
}

impl ArchiveConfig {
    pub fn is_readable(&self) -> bool {
        self.get.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.put.is_some()
    }
}

/// One configured history archive.
#[derive(Debug)]
pub struct Archive {
    config: ArchiveConfig,
}

impl Archive {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn can_read(&self) -> bool {
        self.config.is_readable()
    }

    pub fn can_write(&self) -> bool {
        self.config.is_writable()
    }

    fn format_command(template: &str, args: &[&str]) -> String {
        let mut command = template.to_string();
        for (i, arg) in args.iter().enumerate() {
            command = command.replace(&format!("{{{i}}}"), arg);
        }
        command
    }

    async fn execute(&self, command: &str) -> std::result::Result<(), String> {
        debug!(archive = %self.config.name, command = %command, "running archive command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                archive = %self.config.name,
                command = %command,
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "archive command failed"
            );
            Err(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            ))
        }
    }

    /// Download `remote` into `local`.
    ///
    /// A failing get command is reported as a missing file: the transport
    /// cannot distinguish absence from refusal, and callers treat both as
    /// the archive not serving the object.
    pub async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        let get = self
            .config
            .get
            .as_deref()
            .ok_or_else(|| HistoryError::ArchiveUnavailable(format!(
                "archive {} has no get command",
                self.config.name
            )))?;
        let local_str = local.to_string_lossy();
        let command = Self::format_command(get, &[remote, &local_str]);
        self.execute(&command)
            .await
            .map_err(|_| HistoryError::MissingFile(remote.to_string()))
    }

    /// Upload `local` to `remote`.
    pub async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let put = self
            .config
            .put
            .as_deref()
            .ok_or_else(|| HistoryError::ArchiveUnavailable(format!(
                "archive {} has no put command",
                self.config.name
            )))?;
        if !local.exists() {
            return Err(HistoryError::MissingFile(local.display().to_string()));
        }
        let local_str = local.to_string_lossy();
        let command = Self::format_command(put, &[&local_str, remote]);
        self.execute(&command)
            .await
            .map_err(|e| HistoryError::ArchiveUnavailable(format!(
                "put to {} failed: {e}",
                self.config.name
            )))
    }

    /// Create a remote directory.
    pub async fn mkdir(&self, remote_dir: &str) -> Result<()> {
        let mkdir = self
            .config
            .mkdir
            .as_deref()
            .ok_or_else(|| HistoryError::ArchiveUnavailable(format!(
                "archive {} has no mkdir command",
                self.config.name
            )))?;
        let command = Self::format_command(mkdir, &[remote_dir]);
        self.execute(&command)
            .await
            .map_err(|e| HistoryError::ArchiveUnavailable(format!(
                "mkdir on {} failed: {e}",
                self.config.name
            )))
    }

    /// Fetch a gzipped remote file and return its decompressed bytes.
    pub async fn fetch_gzipped(&self, remote: &str, scratch: &Path) -> Result<Vec<u8>> {
        let local = scratch.join(remote.replace('/', "_"));
        self.get_file(remote, &local).await?;
        let raw = std::fs::read(&local)?;
        let bytes = gunzip_bytes(&raw)
            .map_err(|e| HistoryError::CorruptedArchive(format!("{remote}: {e}")))?;
        let _ = std::fs::remove_file(&local);
        Ok(bytes)
    }

    /// Fetch the archive state for a checkpoint.
    pub async fn get_checkpoint_has(
        &self,
        checkpoint: u32,
        scratch: &Path,
    ) -> Result<HistoryArchiveState> {
        let bytes = self.fetch_gzipped(&paths::has_path(checkpoint), scratch).await?;
        let json = String::from_utf8(bytes)
            .map_err(|e| HistoryError::CorruptedArchive(e.to_string()))?;
        HistoryArchiveState::from_json(&json)
    }

    /// Fetch the archive's root (most recent) state.
    pub async fn get_root_has(&self, scratch: &Path) -> Result<HistoryArchiveState> {
        let bytes = self.fetch_gzipped(paths::ROOT_HAS_PATH, scratch).await?;
        let json = String::from_utf8(bytes)
            .map_err(|e| HistoryError::CorruptedArchive(e.to_string()))?;
        HistoryArchiveState::from_json(&json)
    }

    /// Fetch the ordered ledger headers of a checkpoint.
    pub async fn get_ledger_headers(
        &self,
        checkpoint: u32,
        scratch: &Path,
    ) -> Result<Vec<LedgerHeaderHistoryEntry>> {
        let bytes = self.fetch_gzipped(&paths::ledger_path(checkpoint), scratch).await?;
        bincode::deserialize(&bytes)
            .map_err(|e| HistoryError::CorruptedArchive(format!("ledger-{checkpoint:08x}: {e}")))
    }

    /// Fetch the per-ledger transaction sets of a checkpoint.
    pub async fn get_transactions(
        &self,
        checkpoint: u32,
        scratch: &Path,
    ) -> Result<Vec<TransactionHistoryEntry>> {
        let bytes = self
            .fetch_gzipped(&paths::transactions_path(checkpoint), scratch)
            .await?;
        bincode::deserialize(&bytes).map_err(|e| {
            HistoryError::CorruptedArchive(format!("transactions-{checkpoint:08x}: {e}"))
        })
    }

    /// Fetch and decode a bucket. The content hash is not checked here;
    /// the caller verifies it against the requested hash.
    pub async fn get_bucket(&self, hash: &Hash256, scratch: &Path) -> Result<Bucket> {
        let bytes = self.fetch_gzipped(&paths::bucket_path(hash), scratch).await?;
        Bucket::from_bytes(&bytes)
            .map_err(|e| HistoryError::CorruptedArchive(format!("bucket {hash}: {e}")))
    }
}

/// The set of archives a node is configured with.
#[derive(Default)]
pub struct ArchiveManager {
    archives: Vec<Arc<Archive>>,
}

impl ArchiveManager {
    pub fn new(configs: Vec<ArchiveConfig>) -> Self {
        Self {
            archives: configs
                .into_iter()
                .map(|c| Arc::new(Archive::new(c)))
                .collect(),
        }
    }

    pub fn archives(&self) -> &[Arc<Archive>] {
        &self.archives
    }

    pub fn has_any_writable(&self) -> bool {
        self.archives.iter().any(|a| a.can_write())
    }

    pub fn writable_archives(&self) -> Vec<Arc<Archive>> {
        self.archives.iter().filter(|a| a.can_write()).cloned().collect()
    }

    /// The first readable archive, used for catchup downloads.
    pub fn readable_archive(&self) -> Result<Arc<Archive>> {
        self.archives
            .iter()
            .find(|a| a.can_read())
            .cloned()
            .ok_or(HistoryError::NoArchiveAvailable)
    }

    pub fn archive_by_name(&self, name: &str) -> Option<Arc<Archive>> {
        self.archives.iter().find(|a| a.name() == name).cloned()
    }

    /// Initialize a named archive: create the root directory layout and
    /// publish `root_has` as the archive's well-known state.
    pub async fn initialize_archive(
        &self,
        name: &str,
        root_has: &HistoryArchiveState,
        scratch: &Path,
    ) -> Result<()> {
        let archive = self
            .archive_by_name(name)
            .ok_or_else(|| HistoryError::ArchiveUnavailable(format!("unknown archive {name}")))?;
        if !archive.can_write() {
            return Err(HistoryError::ArchiveUnavailable(format!(
                "archive {name} is not writable"
            )));
        }

        archive.mkdir(paths::remote_dir(paths::ROOT_HAS_PATH)).await?;
        let json = root_has.to_json()?;
        let local = scratch.join("root-has.json.gz");
        quill_common::fs::write_gzipped(&local, json.as_bytes())?;
        archive.put_file(&local, paths::ROOT_HAS_PATH).await?;
        info!(archive = name, "initialized history archive");
        Ok(())
    }
}
