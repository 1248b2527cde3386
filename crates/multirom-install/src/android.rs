//! Android ROM installation

use std::fs::{self, File};
use std::io;
use std::path::Path;

use multirom_core::{Error, Result};
use multirom_package::Package;
use multirom_pipeline::{export_boot, BOOT_IMAGE};

use crate::session::MultiRom;

impl MultiRom {
    /// boot.img export, kernel decision, then the package flash
    pub(crate) fn install_android(&mut self, name: &str, rom_dir: &Path, package: &Path) -> Result<()> {
        tracing::info!("Processing boot.img of ROM {}...", name);
        self.extract_boot_image(package, rom_dir)?;
        export_boot(&mut *self.host, rom_dir, &self.config.scratch.boot_dir).map_err(|e| {
            tracing::error!("Failed to export boot files of {}: {}", name, e);
            e
        })?;
        self.apply_kernel_decision(rom_dir)?;
        self.flash_package(name, package)
    }

    /// Write the package's boot.img, or the host boot partition, to `<rom>/boot.img`
    fn extract_boot_image(&mut self, package: &Path, rom_dir: &Path) -> Result<()> {
        let dest = rom_dir.join(BOOT_IMAGE);
        let mut zip = Package::open(package)?;

        if zip.has_entry(BOOT_IMAGE) {
            tracing::info!("Extracting boot.img from ZIP file...");
            return zip.extract_file(BOOT_IMAGE, &dest);
        }

        tracing::error!("boot.img not found in the root of ZIP file!");
        if !self.config.boot_fallback_to_host {
            return Err(Error::artifact_missing(format!(
                "{} in {}",
                BOOT_IMAGE,
                package.display()
            )));
        }

        let partition = &self.config.boot_partition;
        tracing::warn!("WARNING: Using current boot sector as boot.img!!");
        let mut src = File::open(partition).map_err(|e| {
            tracing::error!("Failed to open boot sector {}: {}", partition.display(), e);
            e
        })?;
        let mut out = File::create(&dest)?;
        io::copy(&mut src, &mut out)?;
        out.sync_all()?;

        if fs::metadata(&dest)?.len() == 0 {
            return Err(Error::artifact_missing(dest.display().to_string()));
        }
        Ok(())
    }
}
