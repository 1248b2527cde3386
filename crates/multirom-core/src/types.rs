//! Core types for MultiROM

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name shown for the host ROM living on the default partitions
pub const INTERNAL_ROM_NAME: &str = "Internal";

/// Where a ROM's volumes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RomLocation {
    /// Plain directories under the internal roms root
    Internal,
    /// Plain directories on an externally mounted volume
    ExternalDirectory,
    /// Loopback image files on an externally mounted volume
    ExternalImage,
}

impl RomLocation {
    /// Backing substrate of every volume at this location
    pub fn substrate(&self) -> Substrate {
        match self {
            RomLocation::Internal | RomLocation::ExternalDirectory => Substrate::Directory,
            RomLocation::ExternalImage => Substrate::Image,
        }
    }

    /// True when the ROM lives on the internal data partition
    pub fn is_internal(&self) -> bool {
        matches!(self, RomLocation::Internal)
    }
}

impl fmt::Display for RomLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RomLocation::Internal => "internal",
            RomLocation::ExternalDirectory => "external directory",
            RomLocation::ExternalImage => "external image",
        };
        f.write_str(s)
    }
}

/// How a volume is backed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Substrate {
    Directory,
    Image,
}

/// The kind of operating system installed in a ROM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsKind {
    Android,
    ForeignOs,
    GenericInstaller,
    Unknown,
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OsKind::Android => "Android",
            OsKind::ForeignOs => "foreign OS",
            OsKind::GenericInstaller => "generic installer",
            OsKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A classified ROM: OS kind paired with its storage location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RomKind {
    Android(RomLocation),
    ForeignOs(RomLocation),
    GenericInstaller(RomLocation),
}

impl RomKind {
    /// Build a kind from its parts, rejecting [`OsKind::Unknown`]
    pub fn new(os: OsKind, location: RomLocation) -> Result<Self> {
        match os {
            OsKind::Android => Ok(RomKind::Android(location)),
            OsKind::ForeignOs => Ok(RomKind::ForeignOs(location)),
            OsKind::GenericInstaller => Ok(RomKind::GenericInstaller(location)),
            OsKind::Unknown => Err(Error::ClassificationUnknown(format!(
                "no OS kind for {} ROM",
                location
            ))),
        }
    }

    pub fn os_kind(&self) -> OsKind {
        match self {
            RomKind::Android(_) => OsKind::Android,
            RomKind::ForeignOs(_) => OsKind::ForeignOs,
            RomKind::GenericInstaller(_) => OsKind::GenericInstaller,
        }
    }

    pub fn location(&self) -> RomLocation {
        match self {
            RomKind::Android(l) | RomKind::ForeignOs(l) | RomKind::GenericInstaller(l) => *l,
        }
    }

    pub fn substrate(&self) -> Substrate {
        self.location().substrate()
    }

    /// Whether the ROM keeps its own boot image and `boot/` artifact folder
    pub fn has_boot_folder(&self) -> bool {
        matches!(self, RomKind::Android(_))
    }
}

impl fmt::Display for RomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.os_kind(), self.location())
    }
}

/// A ROM found under the roms root. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomDescriptor {
    /// Directory name, unique within the roms root
    pub name: String,

    /// Classified kind, `None` when no marker matched
    pub kind: Option<RomKind>,
}

impl RomDescriptor {
    pub fn new(name: impl Into<String>, kind: Option<RomKind>) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn os_kind(&self) -> OsKind {
        self.kind.map(|k| k.os_kind()).unwrap_or(OsKind::Unknown)
    }

    pub fn location(&self) -> Option<RomLocation> {
        self.kind.map(|k| k.location())
    }

    /// The kind, or [`Error::ClassificationUnknown`]
    pub fn require_kind(&self) -> Result<RomKind> {
        self.kind
            .ok_or_else(|| Error::ClassificationUnknown(self.name.clone()))
    }
}

impl fmt::Display for RomDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{:<28} {}", self.name, kind),
            None => write!(f, "{:<28} unknown", self.name),
        }
    }
}

/// A named, sized storage volume declared beyond the fixed Android set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseFolder {
    pub name: String,

    /// Smallest image size the installer accepts, in MiB
    pub min_size_mb: i64,

    /// Image size to create, in MiB
    pub size_mb: i64,
}

impl BaseFolder {
    pub fn new(name: impl Into<String>, min_size_mb: i64, size_mb: i64) -> Self {
        Self {
            name: name.into(),
            min_size_mb,
            size_mb,
        }
    }
}

/// How a single volume is backed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeBacking {
    /// Directory created with the given permission bits
    Directory { mode: u32 },
    /// Zero-filled, formatted image of the given size in MiB
    Image { size_mb: i64 },
}

/// One named volume of a ROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub backing: VolumeBacking,
}

impl Volume {
    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        Self {
            name: name.into(),
            backing: VolumeBacking::Directory { mode },
        }
    }

    pub fn image(name: impl Into<String>, size_mb: i64) -> Self {
        Self {
            name: name.into(),
            backing: VolumeBacking::Image { size_mb },
        }
    }

    /// Path of this volume relative to the ROM directory
    pub fn file_name(&self) -> String {
        match self.backing {
            VolumeBacking::Directory { .. } => self.name.clone(),
            VolumeBacking::Image { .. } => format!("{}.img", self.name),
        }
    }
}

/// Base path of a ROM plus the volumes it is made of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    pub base: PathBuf,
    pub volumes: Vec<Volume>,
}

impl StorageRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            volumes: Vec::new(),
        }
    }

    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute path of the named volume
    pub fn volume_path(&self, name: &str) -> Option<PathBuf> {
        self.volumes
            .iter()
            .find(|v| v.name == name)
            .map(|v| self.base.join(v.file_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rom_kind_parts() {
        let kind = RomKind::new(OsKind::Android, RomLocation::ExternalImage).unwrap();
        assert_eq!(kind.os_kind(), OsKind::Android);
        assert_eq!(kind.location(), RomLocation::ExternalImage);
        assert_eq!(kind.substrate(), Substrate::Image);
        assert!(kind.has_boot_folder());

        let kind = RomKind::new(OsKind::ForeignOs, RomLocation::Internal).unwrap();
        assert_eq!(kind.substrate(), Substrate::Directory);
        assert!(!kind.has_boot_folder());
    }

    #[test]
    fn test_rom_kind_rejects_unknown() {
        let err = RomKind::new(OsKind::Unknown, RomLocation::Internal).unwrap_err();
        assert!(matches!(err, Error::ClassificationUnknown(_)));
    }

    #[test]
    fn test_descriptor_unknown() {
        let rom = RomDescriptor::new("broken", None);
        assert_eq!(rom.os_kind(), OsKind::Unknown);
        assert!(rom.location().is_none());
        assert!(rom.require_kind().is_err());
    }

    #[test]
    fn test_storage_root_volume_paths() {
        let root = StorageRoot::new("/roms/MyROM")
            .with_volume(Volume::directory("boot", 0o777))
            .with_volume(Volume::image("system", 640));

        assert_eq!(root.volume_path("boot").unwrap(), PathBuf::from("/roms/MyROM/boot"));
        assert_eq!(
            root.volume_path("system").unwrap(),
            PathBuf::from("/roms/MyROM/system.img")
        );
        assert!(root.volume_path("data").is_none());
    }
}
