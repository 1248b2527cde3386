//! Roms root resolution
//!
//! ROMs live either under `<multirom>/roms/` on the internal data partition
//! or under `multirom/` on an external volume mounted for the session.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use multirom_core::{Cmd, EngineConfig, Error, Host, MountRequest, Result, RomLocation};

use crate::classify::RootContext;

/// Label of the internal install location
pub const INTERNAL_LOCATION_LABEL: &str = "Internal memory";

/// Where new ROMs are installed and existing ones listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallLocation {
    Internal,
    External { device: PathBuf, fs_type: String },
}

impl InstallLocation {
    /// Location kind a new ROM gets at this install location
    pub fn rom_location(&self) -> RomLocation {
        match self {
            InstallLocation::Internal => RomLocation::Internal,
            InstallLocation::External { fs_type, .. } if fs_type.starts_with("ext") => {
                RomLocation::ExternalDirectory
            }
            InstallLocation::External { .. } => RomLocation::ExternalImage,
        }
    }

    pub fn context(&self) -> RootContext {
        match self {
            InstallLocation::Internal => RootContext::Internal,
            InstallLocation::External { .. } => RootContext::External,
        }
    }
}

impl FromStr for InstallLocation {
    type Err = Error;

    /// Parses `Internal memory` or `<device> (<fstype>)`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == INTERNAL_LOCATION_LABEL || s.eq_ignore_ascii_case("internal") {
            return Ok(InstallLocation::Internal);
        }

        let (device, rest) = s
            .split_once(' ')
            .ok_or_else(|| Error::custom(format!("invalid install location '{}'", s)))?;

        let fs_type = rest
            .trim()
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::custom(format!("invalid install location '{}'", s)))?;

        Ok(InstallLocation::External {
            device: PathBuf::from(device),
            fs_type: fs_type.to_string(),
        })
    }
}

impl fmt::Display for InstallLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallLocation::Internal => f.write_str(INTERNAL_LOCATION_LABEL),
            InstallLocation::External { device, fs_type } => {
                write!(f, "{} ({})", device.display(), fs_type)
            }
        }
    }
}

/// The active roms root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomsRoot {
    pub path: PathBuf,
    pub location: InstallLocation,
    /// Mountpoint held by this root, released on [`RomsRoot::release`]
    mountpoint: Option<PathBuf>,
}

impl RomsRoot {
    /// The internal roms root, `<multirom>/roms/`
    pub fn internal(multirom_dir: &Path) -> Self {
        Self {
            path: multirom_dir.join("roms"),
            location: InstallLocation::Internal,
            mountpoint: None,
        }
    }

    /// Resolve a roms root, mounting the external volume if needed
    ///
    /// Whatever was left mounted at the external mountpoint is unmounted
    /// first. NTFS volumes are mounted through the bundled `ntfs-3g`.
    pub fn open(
        host: &mut dyn Host,
        config: &EngineConfig,
        multirom_dir: &Path,
        location: &InstallLocation,
    ) -> Result<Self> {
        let (device, fs_type) = match location {
            InstallLocation::Internal => return Ok(Self::internal(multirom_dir)),
            InstallLocation::External { device, fs_type } => (device, fs_type),
        };

        let mnt = &config.scratch.external_mount;
        if host.is_mounted(mnt) {
            if let Err(e) = host.unmount(mnt) {
                tracing::warn!("Failed to unmount {}: {}", mnt.display(), e);
            }
        }
        fs::create_dir_all(mnt)?;

        let mounted = if fs_type.starts_with("ntfs") {
            host.run(
                &Cmd::new(multirom_dir.join("ntfs-3g").to_string_lossy())
                    .arg_path(device)
                    .arg_path(mnt),
            )
            .map(|_| ())
        } else {
            host.mount(&MountRequest::new(device, mnt))
        };

        if let Err(e) = mounted {
            tracing::error!("Failed to mount {} at {}: {}", location, mnt.display(), e);
            return Err(e);
        }

        let path = mnt.join("multirom");
        fs::create_dir_all(&path)?;

        tracing::info!("Using roms folder {} on {}", path.display(), location);
        Ok(Self {
            path,
            location: location.clone(),
            mountpoint: Some(mnt.clone()),
        })
    }

    pub fn context(&self) -> RootContext {
        self.location.context()
    }

    pub fn rom_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Unmount the external volume, if this root holds one
    pub fn release(&mut self, host: &mut dyn Host) {
        if let Some(mnt) = self.mountpoint.take() {
            if let Err(e) = host.unmount(&mnt) {
                tracing::warn!("Failed to unmount {}: {}", mnt.display(), e);
            }
        }
    }
}
