//! Adding a new ROM
//!
//! Name resolution, layout creation, then the install of the ROM's OS kind.
//! Any failure after the layout exists erases the whole ROM directory.

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{BaseFolder, Error, OsKind, Result, RomKind};
use multirom_layout::{create_layout, plan_layout, resolve_name, InstallLocation};
use multirom_package::InstallerPackage;

use crate::session::MultiRom;

/// What a new ROM is installed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomSource {
    /// A flashable Android package
    Package(PathBuf),
    /// A foreign OS root filesystem image (`*.img` or `*.img.gz`)
    ForeignImage {
        image: PathBuf,
        /// Kernel boot image attached to the ROM
        boot_image: Option<PathBuf>,
    },
    /// A generic installer package carrying a `manifest.txt`
    Installer(PathBuf),
}

impl RomSource {
    pub fn os_kind(&self) -> OsKind {
        match self {
            RomSource::Package(_) => OsKind::Android,
            RomSource::ForeignImage { .. } => OsKind::ForeignOs,
            RomSource::Installer(_) => OsKind::GenericInstaller,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            RomSource::Package(p) | RomSource::Installer(p) => p,
            RomSource::ForeignImage { image, .. } => image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub source: RomSource,
    pub location: InstallLocation,
    /// Overrides the name derived from the source
    pub name: Option<String>,
}

impl AddRequest {
    pub fn new(source: RomSource) -> Self {
        Self {
            source,
            location: InstallLocation::Internal,
            name: None,
        }
    }

    pub fn location(mut self, location: InstallLocation) -> Self {
        self.location = location;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl MultiRom {
    /// Install a new ROM, returning its name
    ///
    /// On failure nothing of the new ROM is left behind. The session is back
    /// on the internal roms root afterwards either way.
    pub fn add_rom(&mut self, request: &AddRequest) -> Result<String> {
        let result = self
            .set_location(&request.location)
            .and_then(|_| self.add_rom_at(request));

        if let Err(e) = self.set_location(&InstallLocation::Internal) {
            tracing::warn!("Failed to return to internal memory: {}", e);
        }
        result
    }

    fn add_rom_at(&mut self, request: &AddRequest) -> Result<String> {
        let source = request.source.path();
        if !source.exists() {
            tracing::error!("Source {} does not exist", source.display());
            return Err(Error::not_found(source.display().to_string()));
        }

        let location = request.location.rom_location();
        let mut installer = match &request.source {
            RomSource::Installer(path) => {
                let package = InstallerPackage::open(path)?;
                package.manifest().check_location(location)?;
                Some(package)
            }
            _ => None,
        };

        let kind = RomKind::new(request.source.os_kind(), location)?;

        let explicit = request
            .name
            .as_deref()
            .or_else(|| installer.as_ref().and_then(|p| p.manifest().rom_name()));
        let name = resolve_name(&self.roms.path, Some(source), explicit, self.config.max_name_len)?;

        let rom_dir = self.roms.rom_path(&name);
        if fs::symlink_metadata(&rom_dir).is_ok() {
            tracing::error!("ROM {} already exists", name);
            return Err(Error::AlreadyExists(rom_dir.display().to_string()));
        }

        let folders = match &installer {
            Some(package) => package.manifest().base_folders()?,
            None => self.default_base_folders(kind),
        };

        tracing::info!("Installing ROM {} ({})...", name, kind);
        let result = self.create_and_install(
            &name,
            &rom_dir,
            kind,
            &request.source,
            installer.as_mut(),
            &folders,
        );

        match result {
            Ok(()) => {
                self.host.sync();
                tracing::info!("ROM {} installed", name);
                Ok(name)
            }
            Err(e) => {
                tracing::error!("Erasing incomplete ROM...");
                if let Err(rm) = fs::remove_dir_all(&rom_dir) {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::error!("Failed to erase {}: {}", rom_dir.display(), rm);
                    }
                }
                self.host.sync();
                Err(e)
            }
        }
    }

    fn default_base_folders(&self, kind: RomKind) -> Vec<BaseFolder> {
        let names: &[&str] = match kind.os_kind() {
            OsKind::ForeignOs => &["root"],
            _ => &["system", "data", "cache"],
        };
        names
            .iter()
            .filter_map(|n| {
                let size = self.config.default_volume_size(n)?;
                Some(BaseFolder::new(*n, size, size))
            })
            .collect()
    }

    fn create_and_install(
        &mut self,
        name: &str,
        rom_dir: &Path,
        kind: RomKind,
        source: &RomSource,
        installer: Option<&mut InstallerPackage>,
        folders: &[BaseFolder],
    ) -> Result<()> {
        let layout = plan_layout(kind, rom_dir, folders);
        create_layout(&mut *self.host, &layout)?;

        match (source, installer) {
            (RomSource::Package(package), _) => self.install_android(name, rom_dir, package),
            (RomSource::ForeignImage { image, boot_image }, _) => {
                self.install_foreign(rom_dir, kind.substrate(), image, boot_image.as_deref())
            }
            (RomSource::Installer(_), Some(package)) => {
                self.install_generic(rom_dir, kind.substrate(), package, folders)
            }
            (RomSource::Installer(path), None) => {
                Err(Error::invalid_manifest(path.display().to_string()))
            }
        }
    }
}
