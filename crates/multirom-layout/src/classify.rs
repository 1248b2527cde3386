//! ROM type detection from on-disk markers
//!
//! Classification is a pure function of which marker entries exist in the
//! ROM directory and of whether the roms root is internal or external. The
//! same markers mean different substrates in each context.

use std::path::Path;

use multirom_core::{OsKind, RomDescriptor, RomKind, RomLocation};

/// Whether the active roms root is the internal default or an external volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootContext {
    Internal,
    External,
}

/// Marker set checked for each ROM kind, in order
struct Marker {
    entries: &'static [&'static str],
    os: OsKind,
    location: RomLocation,
}

const INTERNAL_MARKERS: &[Marker] = &[
    Marker {
        entries: &["system", "data", "cache"],
        os: OsKind::Android,
        location: RomLocation::Internal,
    },
    Marker {
        entries: &["root"],
        os: OsKind::ForeignOs,
        location: RomLocation::Internal,
    },
];

const EXTERNAL_MARKERS: &[Marker] = &[
    Marker {
        entries: &["system", "data", "cache"],
        os: OsKind::Android,
        location: RomLocation::ExternalDirectory,
    },
    Marker {
        entries: &["system.img", "data.img", "cache.img"],
        os: OsKind::Android,
        location: RomLocation::ExternalImage,
    },
    Marker {
        entries: &["root"],
        os: OsKind::ForeignOs,
        location: RomLocation::ExternalDirectory,
    },
    Marker {
        entries: &["root.img"],
        os: OsKind::ForeignOs,
        location: RomLocation::ExternalImage,
    },
];

/// Classify a ROM directory
///
/// Returns `None` when no marker set matches; the kind is never guessed.
pub fn classify(rom_path: &Path, context: RootContext) -> Option<RomKind> {
    let markers = match context {
        RootContext::Internal => INTERNAL_MARKERS,
        RootContext::External => EXTERNAL_MARKERS,
    };

    markers
        .iter()
        .find(|m| m.entries.iter().all(|e| rom_path.join(e).exists()))
        .and_then(|m| RomKind::new(m.os, m.location).ok())
}

/// Classify a ROM by name under a roms root
pub fn describe(roms_root: &Path, name: &str, context: RootContext) -> RomDescriptor {
    let kind = classify(&roms_root.join(name), context);
    if kind.is_none() {
        tracing::debug!("No marker matched for ROM '{}'", name);
    }
    RomDescriptor::new(name, kind)
}
