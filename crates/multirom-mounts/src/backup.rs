//! Snapshot of the mount configuration files

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{Error, Result};

/// Byte content of each configuration file, taken before a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBackup {
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl MountBackup {
    /// Read every file fully into memory
    ///
    /// Fails with [`Error::ConfigBackupFailed`] on the first unreadable file;
    /// nothing is written either way.
    pub fn snapshot(paths: &[&Path]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read(path).map_err(|e| {
                Error::ConfigBackupFailed(format!("{}: {}", path.display(), e))
            })?;
            files.push((path.to_path_buf(), content));
        }
        Ok(Self { files })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|(p, _)| p.as_path())
    }

    /// Write every file back; returns the number of files that failed
    pub fn restore(&self) -> usize {
        let mut failed = 0;
        for (path, content) in &self.files {
            if let Err(e) = fs::write(path, content) {
                tracing::warn!("Failed to restore {}: {}", path.display(), e);
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let fstab = dir.path().join("fstab");
        let recovery = dir.path().join("recovery.fstab");
        fs::write(&fstab, b"/dev/block/mmcblk0p8 /data ext4 rw\n").unwrap();
        fs::write(&recovery, b"").unwrap();

        let backup = MountBackup::snapshot(&[&fstab, &recovery]).unwrap();
        fs::write(&fstab, b"changed").unwrap();
        fs::write(&recovery, b"changed too").unwrap();

        assert_eq!(backup.restore(), 0);
        assert_eq!(fs::read(&fstab).unwrap(), b"/dev/block/mmcblk0p8 /data ext4 rw\n");
        assert!(fs::read(&recovery).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_fails_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("fstab");
        fs::write(&present, b"x").unwrap();
        let missing = dir.path().join("recovery.fstab");

        let err = MountBackup::snapshot(&[&present, &missing]).unwrap_err();
        assert!(matches!(err, Error::ConfigBackupFailed(_)));
        assert_eq!(fs::read(&present).unwrap(), b"x");
    }
}
