//! Boot image write-back and verification
//!
//! Files are replaced through a sibling temp file and a rename. Block
//! devices are written in place and read back to compare SHA-256 digests.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use multirom_core::{Error, Result};

/// SHA-256 of the first `limit` bytes of a file (or all of it), as hex
pub fn sha256_file(path: &Path, limit: Option<u64>) -> Result<String> {
    let file = File::open(path)?;
    let mut reader: Box<dyn Read> = match limit {
        Some(n) => Box::new(file.take(n)),
        None => Box::new(file),
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

/// Replace `dest` with the content of `image`
pub fn write_image(image: &Path, dest: &Path) -> Result<()> {
    if is_block_device(dest) {
        return write_block_device(image, dest);
    }

    let tmp = temp_sibling(dest);
    if let Err(e) = fs::copy(image, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fs::rename(&tmp, dest)?;
    Ok(())
}

fn write_block_device(image: &Path, dest: &Path) -> Result<()> {
    let data = fs::read(image)?;
    let expected = sha256_file(image, None)?;

    tracing::info!("Writing boot image to {}", dest.display());
    let mut device = OpenOptions::new().write(true).open(dest)?;
    device.write_all(&data)?;
    device.sync_all()?;
    drop(device);

    let written = sha256_file(dest, Some(data.len() as u64))?;
    if written != expected {
        tracing::error!(
            "Boot image verification failed on {}: expected {}, got {}",
            dest.display(),
            expected,
            written
        );
        return Err(Error::custom(format!(
            "verification of {} failed",
            dest.display()
        )));
    }
    tracing::debug!("Verified {} (sha256 {})", dest.display(), expected);
    Ok(())
}
