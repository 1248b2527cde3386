//! Read access to a flashable zip package

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use multirom_core::{
    sanitize_entry_path, validate_allocation_size, Error, Result, MAX_ARCHIVE_ENTRIES,
};

/// An opened zip package
pub struct Package {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish()
    }
}

pub(crate) fn zip_error(path: &Path, e: zip::result::ZipError) -> Error {
    Error::invalid_archive(format!("{}: {}", path.display(), e))
}

impl Package {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(file).map_err(|e| {
            tracing::error!("Failed to open zip file {}", path.display());
            zip_error(path, e)
        })?;
        if archive.len() > MAX_ARCHIVE_ENTRIES {
            return Err(Error::invalid_archive(format!(
                "{} has {} entries",
                path.display(),
                archive.len()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.index_for_name(name).is_some()
    }

    /// Names of all entries, in archive order
    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    /// Read an entry fully into memory, bounded by `limit` bytes
    pub fn read_entry(&mut self, name: &str, limit: u64) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|_| Error::not_found(format!("{} in {}", name, path.display())))?;
        let size = validate_allocation_size(entry.size(), limit, name)?;
        let mut data = Vec::with_capacity(size);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Stream an entry through `f`
    pub fn with_entry<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut dyn Read) -> Result<T>,
    ) -> Result<T> {
        let path = self.path.clone();
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|_| Error::not_found(format!("{} in {}", name, path.display())))?;
        f(&mut entry)
    }

    /// Extract one entry to `dest`, keeping its unix permission bits
    pub fn extract_file(&mut self, name: &str, dest: &Path) -> Result<()> {
        let path = self.path.clone();
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|_| Error::not_found(format!("{} in {}", name, path.display())))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(dest)?;
        io::copy(&mut entry, &mut out)?;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        Ok(())
    }

    /// Extract every entry below the directory `prefix` into `dest`
    ///
    /// Returns the number of files written.
    pub fn extract_dir(&mut self, prefix: &str, dest: &Path) -> Result<usize> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let names: Vec<String> = self
            .archive
            .file_names()
            .filter(|n| n.starts_with(&prefix) && n.len() > prefix.len())
            .map(str::to_string)
            .collect();

        if names.is_empty() {
            return Err(Error::not_found(format!(
                "{} in {}",
                prefix,
                self.path.display()
            )));
        }

        fs::create_dir_all(dest)?;
        let mut written = 0;
        for name in names {
            let target = dest.join(sanitize_entry_path(&name[prefix.len()..])?);
            if name.ends_with('/') {
                fs::create_dir_all(&target)?;
            } else {
                self.extract_file(&name, &target)?;
                written += 1;
            }
        }
        tracing::debug!("Extracted {} files from {}", written, prefix);
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build a zip at `path` from (name, content, mode) triples
    pub(crate) fn build_zip(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content, mode) in entries {
            let options = SimpleFileOptions::default().unix_permissions(*mode);
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_read_and_extract() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rom.zip");
        build_zip(
            &path,
            &[
                ("boot.img", b"ANDROID!", 0o644),
                ("hooks/pre/", b"", 0o755),
                ("hooks/pre/one.sh", b"#!/sbin/sh\n", 0o755),
                ("hooks/pre/two.sh", b"#!/sbin/sh\n", 0o700),
            ],
        );

        let mut pkg = Package::open(&path).unwrap();
        assert!(pkg.has_entry("boot.img"));
        assert!(!pkg.has_entry("system.img"));
        assert_eq!(pkg.read_entry("boot.img", 1024).unwrap(), b"ANDROID!");
        assert!(pkg.read_entry("boot.img", 4).is_err());

        let out = dir.path().join("out");
        assert_eq!(pkg.extract_dir("hooks/pre", &out).unwrap(), 2);
        let mode = fs::metadata(out.join("two.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        assert!(matches!(
            pkg.extract_dir("missing", &out),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.zip");
        fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(Package::open(&path), Err(Error::InvalidArchive(_))));
    }
}
