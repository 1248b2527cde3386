//! Flashing through the package's own `update-binary`

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use multirom_core::{Cmd, Host, PackageInstaller, Result};

use crate::archive::Package;

/// Location of the installer binary inside a package
pub const UPDATE_BINARY: &str = "META-INF/com/google/android/update-binary";

/// Recovery API version passed to `update-binary`
const RECOVERY_API_VERSION: u32 = 3;
/// File descriptor the binary writes its progress commands to
const STATUS_FD: u32 = 1;

/// Runs `update-binary <api> <fd> <package>` the way recovery does
#[derive(Debug, Clone)]
pub struct UpdateBinaryInstaller {
    staging: PathBuf,
}

impl UpdateBinaryInstaller {
    pub fn new(staging: impl Into<PathBuf>) -> Self {
        Self {
            staging: staging.into(),
        }
    }
}

impl PackageInstaller for UpdateBinaryInstaller {
    fn identify(&self) -> &str {
        "update-binary"
    }

    fn install(&mut self, host: &mut dyn Host, package: &Path) -> Result<i32> {
        let binary = self.staging.join("update-binary");
        Package::open(package)?.extract_file(UPDATE_BINARY, &binary)?;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;

        let result = host.run(
            &Cmd::new(binary.to_string_lossy())
                .arg(RECOVERY_API_VERSION.to_string())
                .arg(STATUS_FD.to_string())
                .arg_path(package)
                .allow_fail(),
        );
        let _ = fs::remove_file(&binary);

        let result = result?;
        if !result.success() {
            tracing::error!("update-binary exited with {}", result.code);
        }
        Ok(result.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use multirom_core::{CommandResult, RecordingHost};
    use tempfile::TempDir;

    #[test]
    fn test_runs_update_binary() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[(UPDATE_BINARY, b"\x7fELF", 0o644)]);
        let staging = dir.path().join("staging");
        let binary = staging.join("update-binary");

        let mut host = RecordingHost::new();
        host.on(&binary.to_string_lossy(), |_| Ok(CommandResult::with_code(7)));
        let mut installer = UpdateBinaryInstaller::new(&staging);

        assert_eq!(installer.install(&mut host, &zip).unwrap(), 7);
        let cmd = host.commands()[0].clone();
        assert_eq!(cmd.get_args()[..2], ["3".to_string(), "1".to_string()]);
        assert!(!binary.exists());
    }

    #[test]
    fn test_missing_binary() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[("boot.img", b"", 0o644)]);
        let mut host = RecordingHost::new();
        let mut installer = UpdateBinaryInstaller::new(dir.path().join("staging"));
        assert!(installer.install(&mut host, &zip).is_err());
        assert!(host.commands().is_empty());
    }
}
