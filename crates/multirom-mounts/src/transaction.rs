//! Scoped redirection of the root mounts to a ROM's storage
//!
//! [`MountManager::open`] mounts the backing data device, snapshots the mount
//! configuration files, rewrites them for the target ROM and mounts its
//! volumes at the live mountpoints. The returned [`MountTransaction`] undoes
//! all of it when closed or dropped.

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{
    EngineConfig, Error, Host, MountRequest, Result, RomLocation, Substrate,
};

use crate::alias::PathAlias;
use crate::backup::MountBackup;
use crate::fstab::{render_fstab, render_recovery_fstab, REDIRECTED_VOLUMES};

/// Owner of the one mount configuration snapshot a session may hold
#[derive(Debug)]
pub struct MountManager {
    config: EngineConfig,
    backup: Option<MountBackup>,
    target: Option<PathBuf>,
}

impl MountManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backup: None,
            target: None,
        }
    }

    /// True while a transaction holds the configuration snapshot
    pub fn is_open(&self) -> bool {
        self.backup.is_some()
    }

    /// Redirect the root mounts to the ROM at `rom_path`
    ///
    /// Fails with [`Error::TransactionActive`] if a transaction is open,
    /// [`Error::TransactionOpenFailed`] if the backing device can't be
    /// mounted and [`Error::ConfigBackupFailed`] if a configuration file
    /// can't be read. In those cases nothing was changed. Any later failure
    /// rolls back before it is returned.
    pub fn open<'a>(
        &'a mut self,
        host: &'a mut dyn Host,
        rom_path: &Path,
        location: RomLocation,
    ) -> Result<MountTransaction<'a>> {
        if self.backup.is_some() {
            let current = self
                .target
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(Error::TransactionActive(current));
        }

        let device = &self.config.data_device;

        // 1. backing device
        let mounted_backing = if host.is_mounted(&device.mountpoint) {
            false
        } else {
            fs::create_dir_all(&device.mountpoint).map_err(|e| {
                Error::TransactionOpenFailed(format!("{}: {}", device.mountpoint.display(), e))
            })?;

            let request = MountRequest::new(&device.device, &device.mountpoint)
                .fs_type(&device.fs_type)
                .options(device.options.iter().cloned());

            if let Err(e) = host.mount(&request) {
                tracing::error!("Failed to mount realdata: {}", e);
                return Err(Error::TransactionOpenFailed(e.to_string()));
            }
            true
        };

        // 2. snapshot
        let backup = match MountBackup::snapshot(&[&self.config.fstab, &self.config.recovery_fstab]) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("{}", e);
                if mounted_backing {
                    if let Err(e) = host.unmount(&device.mountpoint) {
                        tracing::warn!("Failed to unmount {}: {}", device.mountpoint.display(), e);
                    }
                }
                return Err(e);
            }
        };

        let base = rebase_internal(&self.config, rom_path, location);
        self.backup = Some(backup);
        self.target = Some(base.clone());

        let mut txn = MountTransaction {
            manager: self,
            host,
            rom_base: base,
            substrate: location.substrate(),
            alias: None,
            guard: None,
            mounted_backing,
            closed: false,
        };

        if let Err(e) = txn.redirect() {
            tracing::error!("Failed to change mountpoints: {}", e);
            txn.close_inner();
            return Err(e);
        }

        Ok(txn)
    }
}

/// Path of an internal ROM as seen through the backing device mountpoint
fn rebase_internal(config: &EngineConfig, rom_path: &Path, location: RomLocation) -> PathBuf {
    if !location.is_internal() {
        return rom_path.to_path_buf();
    }

    match rom_path.strip_prefix(&config.data_device.internal_prefix) {
        Ok(rest) => config.data_device.mountpoint.join(rest),
        Err(_) => rom_path.to_path_buf(),
    }
}

/// An open redirection; closing or dropping it restores the live system
pub struct MountTransaction<'a> {
    manager: &'a mut MountManager,
    host: &'a mut dyn Host,
    rom_base: PathBuf,
    substrate: Substrate,
    alias: Option<PathAlias>,
    guard: Option<PathBuf>,
    mounted_backing: bool,
    closed: bool,
}

impl<'a> MountTransaction<'a> {
    /// The host, for work done inside the redirected mounts
    pub fn host(&mut self) -> &mut dyn Host {
        &mut *self.host
    }

    /// ROM directory as currently named (alias included)
    pub fn rom_base(&self) -> &Path {
        &self.rom_base
    }

    pub fn config(&self) -> &EngineConfig {
        &self.manager.config
    }

    /// Live mountpoint of a redirected volume
    pub fn live_mount(&self, volume: &str) -> PathBuf {
        self.manager.config.live_mount(volume)
    }

    /// Restore the live system; errors are logged only
    pub fn close(mut self) {
        self.close_inner();
    }

    fn redirect(&mut self) -> Result<()> {
        for volume in REDIRECTED_VOLUMES {
            let live = self.live_mount(volume);
            if self.host.is_mounted(&live) {
                self.host.unmount(&live)?;
            }
        }

        // the tables name the alias, the rename follows once they are written
        let alias = PathAlias::plan(&self.rom_base);
        let base = alias.as_ref().map_or(self.rom_base.as_path(), |a| a.alias.as_path());

        let config = &self.manager.config;
        fs::write(
            &config.recovery_fstab,
            render_recovery_fstab(base, self.substrate, &config.recovery_fstab_tail),
        )?;
        fs::write(
            &config.fstab,
            render_fstab(base, self.substrate, &config.fstab_tail),
        )?;

        if let Some(alias) = alias {
            alias.apply()?;
            self.rom_base = alias.alias.clone();
            self.alias = Some(alias);
        }

        let config = &self.manager.config;
        if let Some(ref utility) = config.unmount_guard {
            let parked = guard_path(utility);
            fs::rename(utility, &parked)?;
            self.guard = Some(utility.clone());
        }

        for volume in REDIRECTED_VOLUMES {
            let live = self.live_mount(volume);
            let request = match self.substrate {
                Substrate::Directory => MountRequest::bind(self.rom_base.join(volume), &live),
                Substrate::Image => {
                    MountRequest::loop_image(self.rom_base.join(format!("{}.img", volume)), &live)
                        .fs_type("ext4")
                }
            };
            self.host.mount(&request)?;
        }

        tracing::debug!("Root mounts redirected to {}", self.rom_base.display());
        Ok(())
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(utility) = self.guard.take() {
            if let Err(e) = fs::rename(guard_path(&utility), &utility) {
                tracing::warn!("Failed to restore {}: {}", utility.display(), e);
            }
        }

        for volume in REDIRECTED_VOLUMES {
            let live = self.manager.config.live_mount(volume);
            if self.host.is_mounted(&live) {
                if let Err(e) = self.host.unmount(&live) {
                    tracing::warn!("Failed to unmount {}: {}", live.display(), e);
                }
            }
        }

        if let Some(backup) = self.manager.backup.take() {
            let failed = backup.restore();
            if failed > 0 {
                tracing::warn!("{} mount configuration file(s) not restored", failed);
            }
        }
        self.manager.target = None;

        if let Some(alias) = self.alias.take() {
            if let Err(e) = alias.revert() {
                tracing::warn!(
                    "Failed to rename {} back to {}: {}",
                    alias.alias.display(),
                    alias.original.display(),
                    e
                );
            }
        }

        let config = &self.manager.config;
        if self.mounted_backing {
            if let Err(e) = self.host.unmount(&config.data_device.mountpoint) {
                tracing::warn!(
                    "Failed to unmount {}: {}",
                    config.data_device.mountpoint.display(),
                    e
                );
            }
        }

        let data = config.live_mount("data");
        if !self.host.is_mounted(&data) {
            if let Err(e) = self.host.mount(&MountRequest::from_table(&data)) {
                tracing::warn!("Failed to remount {}: {}", data.display(), e);
            }
        }

        tracing::debug!("Root mounts restored");
    }
}

impl Drop for MountTransaction<'_> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

fn guard_path(utility: &Path) -> PathBuf {
    let mut parked = utility.as_os_str().to_owned();
    parked.push(".bak");
    PathBuf::from(parked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multirom_core::{HostEvent, RecordingHost};
    use tempfile::TempDir;

    const FSTAB: &str = "/dev/block/platform/sdhci-tegra.3/by-name/APP /system ext4 ro\n";
    const RECOVERY: &str = "# mount point\tfstype\t\tdevice\n/data\t\text4\t\t/dev/block/platform/sdhci-tegra.3/by-name/UDA\n";

    struct Fixture {
        dir: TempDir,
        config: EngineConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let etc = dir.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("fstab"), FSTAB).unwrap();
        fs::write(etc.join("recovery.fstab"), RECOVERY).unwrap();

        let mut config = EngineConfig::default();
        config.fstab = etc.join("fstab");
        config.recovery_fstab = etc.join("recovery.fstab");
        config.live_root = dir.path().join("live");
        config.data_device.mountpoint = dir.path().join("realdata");
        config.data_device.internal_prefix = dir.path().join("data");
        Fixture { dir, config }
    }

    fn live_host(config: &EngineConfig) -> RecordingHost {
        let mut host = RecordingHost::new();
        for volume in ["system", "data", "cache"] {
            host.assume_mounted(config.live_mount(volume));
        }
        host
    }

    fn assert_files_untouched(config: &EngineConfig) {
        assert_eq!(fs::read_to_string(&config.fstab).unwrap(), FSTAB);
        assert_eq!(fs::read_to_string(&config.recovery_fstab).unwrap(), RECOVERY);
    }

    #[test]
    fn test_open_close_restores_files() {
        let fx = fixture();
        let rom = fx.dir.path().join("data/media/0/multirom/roms/MyROM");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        let mut manager = MountManager::new(fx.config.clone());

        let txn = manager.open(&mut host, &rom, RomLocation::Internal).unwrap();
        let realdata_rom = fx.dir.path().join("realdata/media/0/multirom/roms/MyROM");
        assert_eq!(txn.rom_base(), realdata_rom.as_path());

        let fstab = fs::read_to_string(&fx.config.fstab).unwrap();
        assert!(fstab.starts_with(&format!("{}/system /system ext4 rw,bind", realdata_rom.display())));
        txn.close();

        assert_files_untouched(&fx.config);
        assert!(!manager.is_open());
        assert!(!host.is_mounted(&fx.config.data_device.mountpoint));
        assert!(host.is_mounted(&fx.config.live_mount("data")));
        assert!(!host.is_mounted(&fx.config.live_mount("system")));
    }

    #[test]
    fn test_image_rom_uses_loop_mounts() {
        let fx = fixture();
        let rom = fx.dir.path().join("mnt/multirom/Img");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        let mut manager = MountManager::new(fx.config.clone());
        {
            let txn = manager.open(&mut host, &rom, RomLocation::ExternalImage).unwrap();
            assert_eq!(txn.rom_base(), rom.as_path());
            let recovery = fs::read_to_string(&fx.config.recovery_fstab).unwrap();
            assert!(recovery.contains(&format!("/system\t\text4\t\t{}/system.img", rom.display())));
        }

        let loops: Vec<_> = host
            .events()
            .iter()
            .filter_map(|e| match e {
                HostEvent::Mount(req) if req.options.iter().any(|o| o == "loop") => Some(req.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[0].source.as_deref(), Some(rom.join("system.img").as_path()));
        assert_files_untouched(&fx.config);
    }

    #[test]
    fn test_backing_mount_failure_touches_nothing() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        host.fail_mount(fx.config.data_device.mountpoint.clone());
        let mut manager = MountManager::new(fx.config.clone());

        let err = manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .err()
            .unwrap();
        assert!(matches!(err, Error::TransactionOpenFailed(_)));
        assert!(!manager.is_open());
        assert_files_untouched(&fx.config);
        assert!(host.is_mounted(&fx.config.live_mount("system")));
    }

    #[test]
    fn test_backup_failure_releases_backing_device() {
        let fx = fixture();
        fs::remove_file(&fx.config.recovery_fstab).unwrap();
        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        let mut manager = MountManager::new(fx.config.clone());
        let err = manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .err()
            .unwrap();

        assert!(matches!(err, Error::ConfigBackupFailed(_)));
        assert!(!manager.is_open());
        assert_eq!(fs::read_to_string(&fx.config.fstab).unwrap(), FSTAB);
        assert!(!host.is_mounted(&fx.config.data_device.mountpoint));
        assert!(host.is_mounted(&fx.config.live_mount("system")));
    }

    #[test]
    fn test_mount_failure_rolls_back() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        host.fail_mount(fx.config.live_mount("cache"));
        let mut manager = MountManager::new(fx.config.clone());

        assert!(manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .is_err());
        assert!(!manager.is_open());
        assert_files_untouched(&fx.config);
        assert!(!host.is_mounted(&fx.config.live_mount("system")));
        assert!(!host.is_mounted(&fx.config.data_device.mountpoint));
    }

    #[test]
    fn test_already_mounted_backing_device_is_kept() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        host.assume_mounted(fx.config.data_device.mountpoint.clone());
        let mut manager = MountManager::new(fx.config.clone());

        manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .unwrap()
            .close();
        assert!(host.is_mounted(&fx.config.data_device.mountpoint));
    }

    #[test]
    fn test_space_alias_is_reverted() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/My ROM");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        let mut manager = MountManager::new(fx.config.clone());
        {
            let txn = manager.open(&mut host, &rom, RomLocation::ExternalDirectory).unwrap();
            let alias = fx.dir.path().join("roms/My-ROM");
            assert_eq!(txn.rom_base(), alias.as_path());
            assert!(alias.is_dir());
            assert!(!rom.exists());
            let fstab = fs::read_to_string(&fx.config.fstab).unwrap();
            assert!(!fstab.contains("My ROM"));
        }
        assert!(rom.is_dir());
        assert!(!fx.dir.path().join("roms/My-ROM").exists());
    }

    #[test]
    fn test_unmount_guard() {
        let fx = fixture();
        let mut config = fx.config.clone();
        let umount = fx.dir.path().join("sbin/umount");
        fs::create_dir_all(umount.parent().unwrap()).unwrap();
        fs::write(&umount, b"#!/sbin/sh\n").unwrap();
        config.unmount_guard = Some(umount.clone());

        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();
        let mut host = live_host(&config);
        let mut manager = MountManager::new(config);

        {
            let _txn = manager.open(&mut host, &rom, RomLocation::ExternalDirectory).unwrap();
            assert!(!umount.exists());
            assert!(fx.dir.path().join("sbin/umount.bak").exists());
        }
        assert!(umount.exists());
        assert!(!fx.dir.path().join("sbin/umount.bak").exists());
    }

    #[test]
    fn test_second_open_is_rejected() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/A");
        fs::create_dir_all(&rom).unwrap();

        let mut host = live_host(&fx.config);
        let mut manager = MountManager::new(fx.config.clone());

        // a leaked transaction never releases its snapshot
        let txn = manager.open(&mut host, &rom, RomLocation::ExternalDirectory).unwrap();
        std::mem::forget(txn);
        assert!(manager.is_open());

        let before = host.events().len();
        let err = manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .err()
            .unwrap();
        assert!(matches!(err, Error::TransactionActive(_)));
        assert_eq!(host.events().len(), before);
    }

    /// Notes whether the ROM still has its original name at each host call
    struct NameWatch<'a> {
        inner: RecordingHost,
        original: &'a Path,
        seen: Vec<(&'static str, bool)>,
    }

    impl Host for NameWatch<'_> {
        fn run(&mut self, cmd: &multirom_core::Cmd) -> Result<multirom_core::CommandResult> {
            self.inner.run(cmd)
        }

        fn mount(&mut self, request: &MountRequest) -> Result<()> {
            self.seen.push(("mount", self.original.exists()));
            self.inner.mount(request)
        }

        fn unmount(&mut self, target: &Path) -> Result<()> {
            self.seen.push(("unmount", self.original.exists()));
            self.inner.unmount(target)
        }

        fn is_mounted(&self, target: &Path) -> bool {
            self.inner.is_mounted(target)
        }

        fn sync(&mut self) {
            self.inner.sync()
        }
    }

    #[test]
    fn test_alias_rename_follows_unmounts() {
        let fx = fixture();
        let rom = fx.dir.path().join("roms/My ROM");
        fs::create_dir_all(&rom).unwrap();

        let mut host = NameWatch {
            inner: live_host(&fx.config),
            original: &rom,
            seen: Vec::new(),
        };
        host.inner.assume_mounted(fx.config.data_device.mountpoint.clone());
        let mut manager = MountManager::new(fx.config.clone());
        manager
            .open(&mut host, &rom, RomLocation::ExternalDirectory)
            .unwrap()
            .close();

        // three live unmounts under the original name, then three mounts on the alias
        assert_eq!(
            &host.seen[..6],
            &[
                ("unmount", true),
                ("unmount", true),
                ("unmount", true),
                ("mount", false),
                ("mount", false),
                ("mount", false),
            ]
        );
        assert!(rom.is_dir());
    }
}
