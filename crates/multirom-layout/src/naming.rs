//! New ROM name resolution

use std::fs;
use std::path::Path;

use multirom_core::{validate_rom_name, Error, Result};

/// Name used when neither an explicit name nor a usable source exists
pub const DEFAULT_ROM_NAME: &str = "ROM";

/// Name given to ROMs installed from a bare `rootfs.img`
pub const FOREIGN_ROOTFS_NAME: &str = "Ubuntu";

/// Pick the base name for a new ROM, before de-duplication
///
/// An explicit name wins. Otherwise the source file's name up to its last
/// dot is used, with `rootfs.img` mapping to a fixed name.
pub fn candidate_name(source: Option<&Path>, explicit: Option<&str>) -> String {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let file_name = match source.and_then(|s| s.file_name()).and_then(|f| f.to_str()) {
        Some(f) => f,
        None => return DEFAULT_ROM_NAME.to_string(),
    };

    if file_name == "rootfs.img" {
        return FOREIGN_ROOTFS_NAME.to_string();
    }

    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name[..idx].to_string(),
        _ => DEFAULT_ROM_NAME.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Make `name` unique among `existing`
///
/// The name is first cut to `max_len` characters. On collision a counter
/// starting at 1 is appended; when base plus counter would exceed `max_len`
/// the counter overwrites the tail of the base instead.
pub fn dedupe_name(name: &str, existing: &[String], max_len: usize) -> String {
    let base = truncate_chars(name, max_len);
    let mut result = base.clone();
    let mut counter = 1u32;

    while existing.iter().any(|e| *e == result) {
        let num = counter.to_string();
        counter += 1;

        let base_len = base.chars().count();
        result = if base_len + num.len() > max_len {
            let keep = base_len.saturating_sub(num.len());
            format!("{}{}", truncate_chars(&base, keep), num)
        } else {
            format!("{}{}", base, num)
        };
    }

    result
}

/// Names already taken under the roms root: directories and symlinks not starting with a dot
pub fn existing_names(roms_root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(roms_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() || file_type.is_symlink() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Resolve a unique, valid name for a new ROM under `roms_root`
pub fn resolve_name(
    roms_root: &Path,
    source: Option<&Path>,
    explicit: Option<&str>,
    max_len: usize,
) -> Result<String> {
    let candidate = candidate_name(source, explicit);
    let existing = existing_names(roms_root).map_err(|e| {
        Error::not_found(format!("roms folder {}: {}", roms_root.display(), e))
    })?;

    let name = dedupe_name(&candidate, &existing, max_len);
    validate_rom_name(&name, max_len)?;

    tracing::debug!("Resolved ROM name '{}' from candidate '{}'", name, candidate);
    Ok(name)
}
