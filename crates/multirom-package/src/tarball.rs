//! gzip-compressed tarball extraction

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use multirom_core::{Error, Result};

/// Unpack a `.tar.gz` stream into `dest`
///
/// Permissions are always kept. Numeric ownership is kept when
/// `preserve_owner` is set, which needs root. Returns the number of entries.
pub fn unpack_tar_gz(reader: impl Read, dest: &Path, preserve_owner: bool) -> Result<usize> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_owner);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let inside = entry.unpack_in(dest).map_err(|e| {
            Error::invalid_archive(format!("failed to unpack {}: {}", path.display(), e))
        })?;
        if !inside {
            tracing::warn!("Skipped tarball entry outside destination: {}", path.display());
            continue;
        }
        count += 1;
    }
    Ok(count)
}

pub fn unpack_tar_gz_file(tarball: &Path, dest: &Path, preserve_owner: bool) -> Result<usize> {
    tracing::info!("Extracting {}...", tarball.display());
    unpack_tar_gz(File::open(tarball)?, dest, preserve_owner)
}
