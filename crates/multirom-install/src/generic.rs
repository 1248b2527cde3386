//! Generic installer ROMs

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{BaseFolder, MountRequest, Result, Substrate};
use multirom_package::{HookStage, InstallerPackage};

use crate::session::MultiRom;

impl MultiRom {
    /// Hooks and payloads of an opened installer package
    ///
    /// Image-backed base folders are loop-mounted under the installer mount
    /// directory while the package runs, and always unmounted afterwards.
    pub(crate) fn install_generic(
        &mut self,
        rom_dir: &Path,
        substrate: Substrate,
        package: &mut InstallerPackage,
        folders: &[BaseFolder],
    ) -> Result<()> {
        if let Some(text) = package.manifest().install_text() {
            for line in text.lines() {
                tracing::info!("{}", line);
            }
        }

        let base = match substrate {
            Substrate::Directory => rom_dir.to_path_buf(),
            Substrate::Image => self.config.scratch.installer_mount.clone(),
        };

        let mut mounted = Vec::new();
        let mut result = Ok(());
        if substrate == Substrate::Image {
            result = self.mount_base_images(rom_dir, &base, folders, &mut mounted);
        }

        let result = result.and_then(|_| self.run_installer(rom_dir, &base, package, folders));

        if substrate == Substrate::Image {
            self.umount_base_images(&base, &mounted);
        }
        result
    }

    fn run_installer(
        &mut self,
        rom_dir: &Path,
        base: &Path,
        package: &mut InstallerPackage,
        folders: &[BaseFolder],
    ) -> Result<()> {
        let hooks = self.config.scratch.hooks_dir.clone();
        package.run_hooks(&mut *self.host, HookStage::PreInstall, &hooks, base, rom_dir)?;
        package.extract_root(rom_dir)?;
        package.extract_tarballs(base, folders, self.preserve_ownership)?;
        package.run_hooks(&mut *self.host, HookStage::PostInstall, &hooks, base, rom_dir)?;
        self.host.sync();
        Ok(())
    }

    fn mount_base_images(
        &mut self,
        rom_dir: &Path,
        base: &Path,
        folders: &[BaseFolder],
        mounted: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for folder in folders {
            let target = base.join(&folder.name);
            fs::create_dir_all(&target)?;
            let image = rom_dir.join(format!("{}.img", folder.name));
            self.host
                .mount(&MountRequest::loop_image(&image, &target).fs_type("ext4"))
                .map_err(|e| {
                    tracing::error!("Failed to mount {}: {}", image.display(), e);
                    e
                })?;
            mounted.push(target);
        }
        Ok(())
    }

    fn umount_base_images(&mut self, base: &Path, mounted: &[PathBuf]) {
        self.host.sync();
        for target in mounted.iter().rev() {
            if let Err(e) = self.host.unmount(target) {
                tracing::warn!("Failed to unmount {}: {}", target.display(), e);
            }
            if let Err(e) = fs::remove_dir(target) {
                tracing::warn!("Failed to remove {}: {}", target.display(), e);
            }
        }
        if let Err(e) = fs::remove_dir(base) {
            tracing::debug!("Leaving {}: {}", base.display(), e);
        }
    }
}
