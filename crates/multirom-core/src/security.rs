//! Validation limits and helpers
//!
//! Boot images, packages and installer tarballs come from untrusted sources.
//! These checks keep their contents inside the directories we extract into.

use crate::Error;
use std::path::{Component, Path, PathBuf};

/// Maximum decompressed ramdisk size (64 MB)
pub const MAX_RAMDISK_SIZE: usize = 64 * 1024 * 1024;

/// Maximum size of a single cpio entry (32 MB)
pub const MAX_CPIO_ENTRY_SIZE: u64 = 32 * 1024 * 1024;

/// Maximum cpio entry name length including the NUL terminator
pub const MAX_CPIO_NAME_SIZE: u64 = 4096;

/// Maximum updater-script size we'll rewrite (8 MB)
pub const MAX_SCRIPT_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum entries read from one archive
pub const MAX_ARCHIVE_ENTRIES: usize = 100_000;

/// Validate that a size is within allocation limits
pub fn validate_allocation_size(size: u64, limit: u64, context: &str) -> crate::Result<usize> {
    if size > limit {
        return Err(Error::invalid_archive(format!(
            "{} size {} exceeds limit {}",
            context, size, limit
        )));
    }

    size.try_into()
        .map_err(|_| Error::invalid_archive(format!("{} size exceeds platform limits", context)))
}

/// Validate a ROM name used as a directory under the roms root
///
/// Rejects empty names, names over `max_len` characters, hidden names, path
/// separators, NUL and control characters.
pub fn validate_rom_name(name: &str, max_len: usize) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name("empty name"));
    }

    if name.chars().count() > max_len {
        return Err(Error::invalid_name(format!(
            "'{}' is longer than {} characters",
            name, max_len
        )));
    }

    if name.starts_with('.') {
        return Err(Error::invalid_name(format!("'{}' starts with a dot", name)));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(Error::invalid_name(format!(
            "'{}' contains a path separator",
            name
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_name(format!(
            "'{}' contains control characters",
            name
        )));
    }

    Ok(())
}

/// Turn an archive entry name into a path relative to the extraction root
///
/// Leading `/` and `./` are stripped. Entries that would escape the root
/// through `..` are rejected.
pub fn sanitize_entry_path(name: &str) -> crate::Result<PathBuf> {
    if name.contains('\0') {
        return Err(Error::invalid_archive(format!(
            "entry name contains null byte: {:?}",
            name
        )));
    }

    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::invalid_archive(format!(
                    "entry escapes extraction root: {}",
                    name
                )));
            }
        }
    }

    Ok(out)
}
