//! Filesystem helpers: gzip round-trips and scoped temporary directories.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

/// Gzip-compress a byte buffer.
pub fn gzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a gzip byte buffer in memory.
pub fn gunzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Write `data` gzipped to `path`, creating parent directories.
pub fn write_gzipped(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, gzip_bytes(data)?)
}

/// Read a gzipped file and decompress it in memory.
pub fn read_gzipped(path: &Path) -> std::io::Result<Vec<u8>> {
    let raw = std::fs::read(path)?;
    gunzip_bytes(&raw)
}

/// Owner of scratch directories.
///
/// Each directory handed out is scope-bound: it is deleted when the returned
/// [`TempDir`] is dropped, so work units can hold their download or staging
/// area for exactly as long as they live.
pub struct TmpDirManager {
    root: TempDir,
}

impl TmpDirManager {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
        })
    }

    /// Create a fresh scratch directory under the manager's root.
    pub fn tmp_dir(&self, prefix: &str) -> std::io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.root.path())
    }

    pub fn root_path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"some checkpoint payload".repeat(100);
        let gz = gzip_bytes(&data).unwrap();
        assert!(gz.len() < data.len());
        assert_eq!(gunzip_bytes(&gz).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        assert!(gunzip_bytes(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_write_read_gzipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/file.gz");
        write_gzipped(&path, b"payload").unwrap();
        assert_eq!(read_gzipped(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_tmp_dir_removed_on_drop() {
        let mgr = TmpDirManager::new().unwrap();
        let path;
        {
            let dir = mgr.tmp_dir("scratch-").unwrap();
            path = dir.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
