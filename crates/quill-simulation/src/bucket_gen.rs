//! Synthetic bucket files for exercising the verifier's error paths.

use std::path::PathBuf;

use quill_bucket::{Bucket, BucketMeta};
use quill_common::{fs::write_gzipped, AccountEntry, AccountId, Hash256};
use quill_history::paths;
use rand::{Rng, RngCore, SeedableRng};
use rand::rngs::StdRng;

/// Condition of a generated bucket in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBucketState {
    /// Correct file at the correct path.
    ContentsOk,
    /// No file is uploaded; only the hash is returned.
    FileNotUploaded,
    /// The file exists but is not valid gzip data.
    CorruptedZippedFile,
    /// The file exists under a hash its contents do not match.
    HashMismatch,
}

/// Writes synthetic buckets directly into a simulated archive directory.
pub struct TestBucketGenerator {
    archive_dir: PathBuf,
    rng: StdRng,
    protocol_version: u32,
}

impl TestBucketGenerator {
    pub fn new(archive_dir: PathBuf, seed: u64, protocol_version: u32) -> Self {
        Self {
            archive_dir,
            rng: StdRng::seed_from_u64(seed),
            protocol_version,
        }
    }

    fn random_hash(&mut self) -> Hash256 {
        let mut bytes = [0u8; 32];
        self.rng.fill_bytes(&mut bytes);
        Hash256::from_bytes(bytes)
    }

    fn random_bucket(&mut self) -> Bucket {
        let entries: Vec<AccountEntry> = (0..8)
            .map(|i| AccountEntry {
                account_id: AccountId::new(format!("synthetic-{i}")),
                balance: self.rng.gen_range(1..1_000_000),
                seq_num: self.rng.gen_range(1..100),
            })
            .collect();
        Bucket::from_entries(
            BucketMeta {
                protocol_version: self.protocol_version,
            },
            entries,
        )
    }

    /// Generate one bucket in the given state and return the hash a
    /// catchup would be told to fetch it by.
    pub fn generate_bucket(&mut self, state: TestBucketState) -> std::io::Result<Hash256> {
        let bucket = self.random_bucket();
        let content_hash = bucket.hash();

        match state {
            TestBucketState::FileNotUploaded => Ok(content_hash),
            TestBucketState::ContentsOk => {
                let path = self.archive_dir.join(paths::bucket_path(&content_hash));
                write_gzipped(&path, &bucket.to_bytes())?;
                Ok(content_hash)
            }
            TestBucketState::HashMismatch => {
                // Advertise a hash the contents do not satisfy.
                let claimed = self.random_hash();
                let path = self.archive_dir.join(paths::bucket_path(&claimed));
                write_gzipped(&path, &bucket.to_bytes())?;
                Ok(claimed)
            }
            TestBucketState::CorruptedZippedFile => {
                let path = self.archive_dir.join(paths::bucket_path(&content_hash));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, b"truncated garbage, not gzip")?;
                Ok(content_hash)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_states_are_deterministic_per_seed() {
        let dir = TempDir::new().unwrap();
        let mut a = TestBucketGenerator::new(dir.path().to_path_buf(), 7, 1);
        let dir2 = TempDir::new().unwrap();
        let mut b = TestBucketGenerator::new(dir2.path().to_path_buf(), 7, 1);
        assert_eq!(
            a.generate_bucket(TestBucketState::ContentsOk).unwrap(),
            b.generate_bucket(TestBucketState::ContentsOk).unwrap()
        );
    }

    #[test]
    fn test_contents_ok_file_exists_at_hash() {
        let dir = TempDir::new().unwrap();
        let mut generator = TestBucketGenerator::new(dir.path().to_path_buf(), 1, 1);
        let hash = generator.generate_bucket(TestBucketState::ContentsOk).unwrap();
        assert!(dir.path().join(paths::bucket_path(&hash)).exists());
    }

    #[test]
    fn test_file_not_uploaded_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut generator = TestBucketGenerator::new(dir.path().to_path_buf(), 2, 1);
        let hash = generator
            .generate_bucket(TestBucketState::FileNotUploaded)
            .unwrap();
        assert!(!dir.path().join(paths::bucket_path(&hash)).exists());
    }

    #[test]
    fn test_hash_mismatch_claims_other_hash() {
        let dir = TempDir::new().unwrap();
        let mut generator = TestBucketGenerator::new(dir.path().to_path_buf(), 3, 1);
        let claimed = generator
            .generate_bucket(TestBucketState::HashMismatch)
            .unwrap();
        let path = dir.path().join(paths::bucket_path(&claimed));
        assert!(path.exists());

        let bytes = quill_common::fs::read_gzipped(&path).unwrap();
        let bucket = Bucket::from_bytes(&bytes).unwrap();
        assert_ne!(bucket.hash(), claimed);
    }
}
