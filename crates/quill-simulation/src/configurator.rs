//! Simulated archives on local temp directories.

use std::path::Path;

use quill_app::Config;
use quill_history::ArchiveConfig;
use tempfile::TempDir;

/// Configures a history archive backed by a temp directory, using plain
/// `cp` and `mkdir -p` as the transfer commands. Writable for the
/// publishing node, read-only for catchup nodes.
pub struct TmpDirArchiveConfigurator {
    name: String,
    dir: TempDir,
}

impl TmpDirArchiveConfigurator {
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            name: name.into(),
            dir: TempDir::new()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archive_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Add this archive to `config`.
    pub fn configure(&self, config: &mut Config, writable: bool) {
        let base = self.dir.path().display();
        config.add_archive(
            self.name.clone(),
            ArchiveConfig {
                name: String::new(),
                get: Some(format!("cp {base}/{{0}} {{1}}")),
                put: writable.then(|| format!("cp {{0}} {base}/{{1}}")),
                mkdir: writable.then(|| format!("mkdir -p {base}/{{0}}")),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_writable_split() {
        let configurator = TmpDirArchiveConfigurator::new("arch").unwrap();

        let mut writer = Config::test_default();
        configurator.configure(&mut writer, true);
        let archive = &writer.archive_configs()[0];
        assert!(archive.is_readable());
        assert!(archive.is_writable());

        let mut reader = Config::test_default();
        configurator.configure(&mut reader, false);
        let archive = &reader.archive_configs()[0];
        assert!(archive.is_readable());
        assert!(!archive.is_writable());
    }
}
