//! Preparing a package for flashing into a secondary ROM

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use multirom_core::{EngineConfig, Error, Result, MAX_SCRIPT_SIZE};

use crate::archive::{zip_error, Package};
use crate::sanitize::ScriptSanitizer;

/// Location of the updater-script inside a package
pub const UPDATER_SCRIPT: &str = "META-INF/com/google/android/updater-script";

/// A package ready to be handed to the installer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPackage {
    /// The package to flash: the scratch copy, or the original
    pub path: PathBuf,
    /// Whether `path` is the scratch copy
    pub copied: bool,
    /// The sanitized script as staged on disk
    pub staged_script: PathBuf,
    staging_root: PathBuf,
}

impl PreparedPackage {
    /// Remove the staged script and the scratch copy
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_dir_all(&self.staging_root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.staging_root.display(), e);
            }
        }
        if self.copied {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Copy (when small enough) and sanitize a package
///
/// Packages at or above the copy threshold are modified in place and are no
/// longer usable outside MultiROM afterwards.
pub fn prepare_package(
    config: &EngineConfig,
    sanitizer: &ScriptSanitizer,
    package: &Path,
) -> Result<PreparedPackage> {
    tracing::info!("Preparing ZIP file...");
    let copy = &config.scratch.package_copy;
    match fs::remove_file(copy) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    let size = fs::metadata(package)?.len();
    let (path, copied) = if size < config.package_copy_threshold() {
        tracing::info!("Copying ZIP to {}...", copy.display());
        if let Some(parent) = copy.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(package, copy)?;
        (copy.clone(), true)
    } else {
        tracing::warn!("=======================================================");
        tracing::warn!("Modifying the real ZIP, it is too big!");
        tracing::warn!("The ZIP file is now unusable for non-MultiROM flashing!");
        tracing::warn!("=======================================================");
        (package.to_path_buf(), false)
    };

    let script = {
        let mut pkg = Package::open(&path)?;
        let data = pkg.read_entry(UPDATER_SCRIPT, MAX_SCRIPT_SIZE).map_err(|e| {
            tracing::error!("Package {} has no readable updater-script", package.display());
            e
        })?;
        String::from_utf8_lossy(&data).into_owned()
    };

    let sanitized = sanitizer.sanitize(&script);

    let staging_root = config.scratch.script_staging.clone();
    let staged_script = staging_root.join("com/google/android/updater-script");
    if let Some(parent) = staged_script.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&staged_script, &sanitized.script)?;

    if sanitized.changed() {
        tracing::info!("Removed {} lines from updater-script", sanitized.dropped);
        replace_entry(&path, UPDATER_SCRIPT, sanitized.script.as_bytes())?;
    } else {
        tracing::info!("No need to change ZIP.");
    }

    Ok(PreparedPackage {
        path,
        copied,
        staged_script,
        staging_root,
    })
}

/// Rewrite `zip_path` with the content of entry `name` replaced
///
/// Other entries are copied without recompression. The new archive is
/// written next to the old one and renamed over it.
pub fn replace_entry(zip_path: &Path, name: &str, content: &[u8]) -> Result<()> {
    let mut tmp = zip_path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = write_replaced(zip_path, &tmp, name, content);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    fs::rename(&tmp, zip_path)?;
    Ok(())
}

fn write_replaced(zip_path: &Path, tmp: &Path, name: &str, content: &[u8]) -> Result<()> {
    let mut archive =
        ZipArchive::new(File::open(zip_path)?).map_err(|e| zip_error(zip_path, e))?;
    let mut writer = ZipWriter::new(File::create(tmp)?);

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(|e| zip_error(zip_path, e))?;
        if entry.name() == name {
            continue;
        }
        writer.raw_copy_file(entry).map_err(|e| zip_error(tmp, e))?;
    }

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    writer
        .start_file(name, options)
        .map_err(|e| zip_error(tmp, e))?;
    writer.write_all(content)?;
    writer.finish().map_err(|e| zip_error(tmp, e))?;

    if !tmp.is_file() {
        return Err(Error::artifact_missing(tmp.display().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use tempfile::TempDir;

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scratch.package_copy = dir.join("mr_update.zip");
        config.scratch.script_staging = dir.join("META-INF");
        config
    }

    const SCRIPT: &[u8] = b"ui_print(\"hi\");\nmount(\"ext4\", \"EMMC\", \"/dev/x\", \"/system\");\npackage_extract_dir(\"system\", \"/system\");\n";

    #[test]
    fn test_small_package_is_copied_and_sanitized() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[(UPDATER_SCRIPT, SCRIPT, 0o644), ("system/build.prop", b"x=1", 0o644)]);
        let original = fs::read(&zip).unwrap();

        let prepared = prepare_package(&config, &ScriptSanitizer::default(), &zip).unwrap();

        assert!(prepared.copied);
        assert_eq!(prepared.path, config.scratch.package_copy);
        assert_eq!(fs::read(&zip).unwrap(), original);

        let mut pkg = Package::open(&prepared.path).unwrap();
        let script = pkg.read_entry(UPDATER_SCRIPT, 1 << 20).unwrap();
        assert_eq!(
            script,
            b"ui_print(\"hi\");\npackage_extract_dir(\"system\", \"/system\");\n"
        );
        assert_eq!(pkg.read_entry("system/build.prop", 16).unwrap(), b"x=1");
        assert_eq!(fs::read(&prepared.staged_script).unwrap(), script);

        prepared.cleanup();
        assert!(!config.scratch.package_copy.exists());
        assert!(!config.scratch.script_staging.exists());
    }

    #[test]
    fn test_large_package_is_rewritten_in_place() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.package_copy_threshold_mb = 0;
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[(UPDATER_SCRIPT, SCRIPT, 0o644)]);

        let prepared = prepare_package(&config, &ScriptSanitizer::default(), &zip).unwrap();
        assert!(!prepared.copied);
        assert_eq!(prepared.path, zip);

        let mut pkg = Package::open(&zip).unwrap();
        let script = pkg.read_entry(UPDATER_SCRIPT, 1 << 20).unwrap();
        assert!(!String::from_utf8(script).unwrap().contains("mount"));

        prepared.cleanup();
        assert!(zip.exists());
    }

    #[test]
    fn test_clean_script_is_untouched() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.package_copy_threshold_mb = 0;
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[(UPDATER_SCRIPT, b"ui_print(\"hi\");\n", 0o644)]);
        let original = fs::read(&zip).unwrap();

        prepare_package(&config, &ScriptSanitizer::default(), &zip).unwrap();
        assert_eq!(fs::read(&zip).unwrap(), original);
    }

    #[test]
    fn test_missing_script() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let zip = dir.path().join("rom.zip");
        build_zip(&zip, &[("boot.img", b"ANDROID!", 0o644)]);

        let err = prepare_package(&config, &ScriptSanitizer::default(), &zip).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
