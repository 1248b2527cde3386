//! The MultiROM session
//!
//! One [`MultiRom`] owns everything that used to be process-wide state: the
//! active roms root, the mount transaction latch and the collaborators.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use multirom_core::{
    validate_rom_name, EngineConfig, Error, Host, KernelDecision, PackageInstaller, Result,
    RomDescriptor, RomKind, SettingsStore, INTERNAL_ROM_NAME,
};
use multirom_layout::{describe, InstallLocation, RomsRoot};
use multirom_mounts::MountManager;
use multirom_package::{prepare_package, PreparedPackage, ScriptSanitizer};
use multirom_pipeline::BootPatcher;

/// Trampoline binary inside the MultiROM directory
pub const TRAMPOLINE_NAME: &str = "trampoline";

/// What [`MultiRom::wipe_rom`] removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeTarget {
    /// `data/dalvik-cache`, `cache/dalvik-cache` and `cache/dc`
    Dalvik,
    System,
    Data,
    Cache,
}

impl WipeTarget {
    fn partition(&self) -> Option<&'static str> {
        match self {
            WipeTarget::Dalvik => None,
            WipeTarget::System => Some("system"),
            WipeTarget::Data => Some("data"),
            WipeTarget::Cache => Some("cache"),
        }
    }
}

impl FromStr for WipeTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dalvik" => Ok(WipeTarget::Dalvik),
            "system" => Ok(WipeTarget::System),
            "data" => Ok(WipeTarget::Data),
            "cache" => Ok(WipeTarget::Cache),
            other => Err(Error::custom(format!("cannot wipe '{}'", other))),
        }
    }
}

impl fmt::Display for WipeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.partition().unwrap_or("dalvik"))
    }
}

/// A MultiROM session
pub struct MultiRom {
    pub(crate) config: EngineConfig,
    pub(crate) multirom_dir: PathBuf,
    pub(crate) host: Box<dyn Host>,
    pub(crate) settings: Box<dyn SettingsStore>,
    pub(crate) installer: Box<dyn PackageInstaller>,
    pub(crate) mounts: MountManager,
    pub(crate) roms: RomsRoot,
    pub(crate) preserve_ownership: bool,
}

impl fmt::Debug for MultiRom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiRom")
            .field("multirom_dir", &self.multirom_dir)
            .field("roms", &self.roms)
            .field("installer", &self.installer.identify())
            .finish()
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    let result = if fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl MultiRom {
    pub fn new(
        config: EngineConfig,
        multirom_dir: impl Into<PathBuf>,
        host: Box<dyn Host>,
        settings: Box<dyn SettingsStore>,
        installer: Box<dyn PackageInstaller>,
    ) -> Self {
        let multirom_dir = multirom_dir.into();
        Self {
            mounts: MountManager::new(config.clone()),
            roms: RomsRoot::internal(&multirom_dir),
            config,
            multirom_dir,
            host,
            settings,
            installer,
            preserve_ownership: true,
        }
    }

    /// Session on the first existing configured MultiROM directory
    pub fn discover(
        config: EngineConfig,
        host: Box<dyn Host>,
        settings: Box<dyn SettingsStore>,
        installer: Box<dyn PackageInstaller>,
    ) -> Result<Self> {
        let dir = config.multirom_dir().map_err(|e| {
            tracing::error!("MultiROM folder not found");
            e
        })?;
        Ok(Self::new(config, dir, host, settings, installer))
    }

    /// Keep numeric file ownership when extracting tarballs (needs root)
    pub fn with_preserve_ownership(mut self, preserve: bool) -> Self {
        self.preserve_ownership = preserve;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn multirom_dir(&self) -> &Path {
        &self.multirom_dir
    }

    pub fn roms_root(&self) -> &RomsRoot {
        &self.roms
    }

    pub fn settings(&self) -> &dyn SettingsStore {
        &*self.settings
    }

    pub fn settings_mut(&mut self) -> &mut dyn SettingsStore {
        &mut *self.settings
    }

    pub fn trampoline(&self) -> PathBuf {
        self.multirom_dir.join(TRAMPOLINE_NAME)
    }

    pub(crate) fn patcher(&self) -> BootPatcher {
        BootPatcher::new(&self.config.scratch.boot_dir, self.trampoline())
    }

    pub fn kernel_decision(&self) -> KernelDecision {
        self.config.kernel_policy.resolve(&*self.settings)
    }

    /// Switch the roms root, releasing an external volume held before
    pub fn set_location(&mut self, location: &InstallLocation) -> Result<()> {
        if *location == self.roms.location && *location == InstallLocation::Internal {
            return Ok(());
        }
        self.roms.release(&mut *self.host);
        self.roms = RomsRoot::internal(&self.multirom_dir);
        self.roms = RomsRoot::open(&mut *self.host, &self.config, &self.multirom_dir, location)?;
        Ok(())
    }

    /// Classify a ROM under the active roms root
    pub fn describe(&self, name: &str) -> RomDescriptor {
        describe(&self.roms.path, name, self.roms.context())
    }

    /// Directory of an existing ROM
    pub(crate) fn existing_rom(&self, name: &str) -> Result<PathBuf> {
        validate_rom_name(name, usize::MAX)?;
        let path = self.roms.rom_path(name);
        if !path.is_dir() {
            tracing::error!("ROM {} not found in {}", name, self.roms.path.display());
            return Err(Error::not_found(path.display().to_string()));
        }
        Ok(path)
    }

    /// Installed ROMs, the internal one first, then by name
    pub fn list_roms(&self) -> Result<Vec<RomDescriptor>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.roms.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            names.push(name);
        }

        names.sort_by(|a, b| {
            (a != INTERNAL_ROM_NAME)
                .cmp(&(b != INTERNAL_ROM_NAME))
                .then_with(|| a.cmp(b))
        });

        Ok(names.iter().map(|n| self.describe(n)).collect())
    }

    pub fn rename_rom(&mut self, from: &str, to: &str) -> Result<()> {
        let src = self.existing_rom(from)?;
        validate_rom_name(to, self.config.max_name_len)?;
        let dest = self.roms.rom_path(to);
        if fs::symlink_metadata(&dest).is_ok() {
            tracing::error!("ROM {} already exists", to);
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }

        tracing::info!("Moving ROM \"{}\" to \"{}\"...", from, to);
        fs::rename(&src, &dest)?;
        Ok(())
    }

    pub fn erase_rom(&mut self, name: &str) -> Result<()> {
        let path = self.existing_rom(name)?;
        tracing::info!("Erasing ROM \"{}\"...", name);
        fs::remove_dir_all(&path).map_err(|e| {
            tracing::error!("Failed to erase {}: {}", name, e);
            e
        })?;
        self.host.sync();
        Ok(())
    }

    /// Wipe part of a ROM through its redirected mounts
    pub fn wipe_rom(&mut self, name: &str, what: WipeTarget) -> Result<()> {
        let path = self.existing_rom(name)?;
        let kind = self.describe(name).require_kind()?;

        tracing::info!("Changing mountpoints...");
        let mut txn = self.mounts.open(&mut *self.host, &path, kind.location())?;

        let targets: Vec<PathBuf> = match what.partition() {
            None => vec![
                txn.live_mount("data").join("dalvik-cache"),
                txn.live_mount("cache").join("dalvik-cache"),
                txn.live_mount("cache").join("dc"),
            ],
            Some(part) => {
                tracing::info!("Wiping ROM's /{}...", part);
                match fs::read_dir(txn.live_mount(part)) {
                    Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
                    Err(e) => {
                        tracing::error!("ERROR: Failed to erase {}: {}", part, e);
                        txn.close();
                        return Err(e.into());
                    }
                }
            }
        };

        let mut result = Ok(());
        for target in targets {
            if what == WipeTarget::Dalvik {
                tracing::info!("Wiping dalvik: {}...", target.display());
            }
            if let Err(e) = remove_if_present(&target) {
                tracing::error!("ERROR: Failed to erase {}: {}", target.display(), e);
                result = Err(e);
                break;
            }
        }

        txn.host().sync();
        tracing::info!("Restoring mountpoints...");
        txn.close();
        result
    }

    /// Flash a package into an installed ROM
    pub fn flash_package(&mut self, name: &str, package: &Path) -> Result<()> {
        let path = self.existing_rom(name)?;
        let kind = self.describe(name).require_kind()?;

        tracing::info!("Flashing ZIP file {}", package.display());
        tracing::info!("ROM: {}", name);

        let sanitizer = ScriptSanitizer::from_config(&self.config);
        let prepared = prepare_package(&self.config, &sanitizer, package)?;
        let result = self.flash_prepared(&path, kind, &prepared);
        prepared.cleanup();

        match &result {
            Ok(()) => tracing::info!("ZIP successfully installed"),
            Err(e) => tracing::error!("Failed to install ZIP! ({})", e),
        }
        result
    }

    fn flash_prepared(
        &mut self,
        rom_path: &Path,
        kind: RomKind,
        prepared: &PreparedPackage,
    ) -> Result<()> {
        tracing::info!("Changing mountpoints");
        let mut txn = self.mounts.open(&mut *self.host, rom_path, kind.location())?;

        let package = remap_package_path(&self.config, &prepared.path);
        let status = self.installer.install(txn.host(), &package);
        txn.close();

        let status = status?;
        if status != 0 {
            return Err(Error::tool_failed(
                self.installer.identify(),
                status,
                format!("installing {}", package.display()),
            ));
        }
        Ok(())
    }

    /// Patch a boot image file or partition node with the trampoline
    pub fn inject_boot(&mut self, image: &Path) -> Result<()> {
        self.patcher().patch(&mut *self.host, image)
    }

    /// Patch or drop a ROM's `boot.img` according to the kernel policy
    pub(crate) fn apply_kernel_decision(&mut self, rom_dir: &Path) -> Result<()> {
        let image = rom_dir.join("boot.img");
        match self.kernel_decision() {
            KernelDecision::Inject => {
                tracing::info!("Injecting boot.img..");
                self.inject_boot(&image)
            }
            KernelDecision::ShareHost => {
                tracing::info!("Sharing the host kernel, removing boot.img");
                remove_if_present(&image)
            }
        }
    }
}

impl Drop for MultiRom {
    fn drop(&mut self) {
        self.roms.release(&mut *self.host);
    }
}

/// Package path as seen while the data partition is redirected
///
/// `/sdcard/` and `/data/media/` resolve through the backing device
/// mountpoint once `/data` belongs to the ROM.
pub fn remap_package_path(config: &EngineConfig, package: &Path) -> PathBuf {
    let realdata = &config.data_device.mountpoint;

    if let Ok(rest) = package.strip_prefix("/sdcard") {
        let media0 = realdata.join("media/0");
        let base = if media0.exists() {
            media0
        } else {
            realdata.join("media")
        };
        return base.join(rest);
    }

    let media = config.data_device.internal_prefix.join("media");
    if let Ok(rest) = package.strip_prefix(&media) {
        return realdata.join("media").join(rest);
    }

    package.to_path_buf()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use multirom_core::{
        KernelPolicy, MemorySettings, RecordingHost, SettingValue, SHARE_KERNEL_SETTING,
    };
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Installer that records what it was asked to flash
    struct FakeInstaller {
        status: i32,
        seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl PackageInstaller for FakeInstaller {
        fn identify(&self) -> &str {
            "fake"
        }

        fn install(&mut self, _host: &mut dyn Host, package: &Path) -> Result<i32> {
            self.seen.lock().unwrap().push(package.to_path_buf());
            Ok(self.status)
        }
    }

    pub(crate) fn test_config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.live_root = dir.join("live");
        config.data_device.mountpoint = dir.join("realdata");
        config.fstab = dir.join("etc/fstab");
        config.recovery_fstab = dir.join("etc/recovery.fstab");
        config.scratch.boot_dir = dir.join("tmp/boot");
        config.scratch.package_copy = dir.join("tmp/mr_update.zip");
        config.scratch.script_staging = dir.join("tmp/META-INF");
        config.scratch.hooks_dir = dir.join("tmp/hooks");
        config.scratch.installer_mount = dir.join("mnt_installer");
        config.scratch.foreign_image_mount = dir.join("mnt_ubuntu");
        config.scratch.foreign_source_mount = dir.join("mnt_ub_img");
        config.scratch.foreign_source_image = dir.join("tmp/rootfs.img");
        config.scratch.external_mount = dir.join("mnt");
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::create_dir_all(dir.join("tmp")).unwrap();
        fs::write(&config.fstab, "fstab\n").unwrap();
        fs::write(&config.recovery_fstab, "recovery\n").unwrap();
        for v in ["system", "data", "cache"] {
            fs::create_dir_all(config.live_mount(v)).unwrap();
        }
        config
    }

    fn session(dir: &Path, status: i32) -> (MultiRom, Arc<Mutex<Vec<PathBuf>>>) {
        let mr = dir.join("multirom");
        fs::create_dir_all(mr.join("roms")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = MultiRom::new(
            test_config(dir),
            &mr,
            Box::new(RecordingHost::new()),
            Box::new(MemorySettings::new()),
            Box::new(FakeInstaller {
                status,
                seen: seen.clone(),
            }),
        );
        (session, seen)
    }

    fn android_rom(session: &MultiRom, name: &str) -> PathBuf {
        let rom = session.roms_root().rom_path(name);
        for v in ["boot", "system", "data", "cache"] {
            fs::create_dir_all(rom.join(v)).unwrap();
        }
        rom
    }

    #[test]
    fn test_list_roms_order() {
        let dir = TempDir::new().unwrap();
        let (session, _) = session(dir.path(), 0);
        android_rom(&session, "zeta");
        android_rom(&session, "Alpha");
        android_rom(&session, INTERNAL_ROM_NAME);
        fs::create_dir_all(session.roms_root().rom_path(".hidden")).unwrap();
        fs::create_dir_all(session.roms_root().rom_path("broken")).unwrap();
        fs::write(session.roms_root().rom_path("file"), b"").unwrap();

        let roms = session.list_roms().unwrap();
        let names: Vec<&str> = roms.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![INTERNAL_ROM_NAME, "Alpha", "broken", "zeta"]);
        assert!(roms[1].kind.is_some());
        assert!(roms[2].kind.is_none());
    }

    #[test]
    fn test_rename_and_erase() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        android_rom(&session, "A");
        android_rom(&session, "B");

        assert!(matches!(session.rename_rom("A", "B"), Err(Error::AlreadyExists(_))));
        assert!(matches!(session.rename_rom("A", "x/y"), Err(Error::InvalidName(_))));
        session.rename_rom("A", "C").unwrap();
        assert!(session.roms_root().rom_path("C/system").is_dir());

        session.erase_rom("C").unwrap();
        assert!(!session.roms_root().rom_path("C").exists());
        assert!(matches!(session.erase_rom("C"), Err(Error::NotFound(_))));
        assert!(session.erase_rom("..").is_err());
    }

    #[test]
    fn test_wipe_dalvik() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        android_rom(&session, "A");
        let data = session.config().live_mount("data");
        let cache = session.config().live_mount("cache");
        fs::create_dir_all(data.join("dalvik-cache/x")).unwrap();
        fs::create_dir_all(cache.join("dc")).unwrap();
        fs::write(data.join("keep"), b"").unwrap();

        session.wipe_rom("A", WipeTarget::Dalvik).unwrap();

        assert!(!data.join("dalvik-cache").exists());
        assert!(!cache.join("dc").exists());
        assert!(data.join("keep").exists());
        assert_eq!(fs::read(&session.config().fstab).unwrap(), b"fstab\n");
    }

    #[test]
    fn test_wipe_partition() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        android_rom(&session, "A");
        let system = session.config().live_mount("system");
        fs::create_dir_all(system.join("app")).unwrap();
        fs::write(system.join("build.prop"), b"").unwrap();

        session.wipe_rom("A", "system".parse().unwrap()).unwrap();

        assert!(system.is_dir());
        assert_eq!(fs::read_dir(&system).unwrap().count(), 0);
    }

    #[test]
    fn test_flash_nonzero_status() {
        let dir = TempDir::new().unwrap();
        let (mut session, seen) = session(dir.path(), 1);
        android_rom(&session, "A");
        let zip = dir.path().join("update.zip");
        {
            use std::io::Write;
            let mut w = zip::ZipWriter::new(fs::File::create(&zip).unwrap());
            w.start_file(
                multirom_package::UPDATER_SCRIPT,
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
            w.write_all(b"mount /system\nui_print(\"x\");\n").unwrap();
            w.finish().unwrap();
        }

        let err = session.flash_package("A", &zip).unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { code: 1, .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!session.config().scratch.package_copy.exists());
        assert_eq!(fs::read(&session.config().fstab).unwrap(), b"fstab\n");
    }

    #[test]
    fn test_kernel_decision_follows_setting() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        assert_eq!(session.kernel_decision(), KernelDecision::Inject);
        session
            .settings_mut()
            .set(SHARE_KERNEL_SETTING, SettingValue::Int(1));
        assert_eq!(session.kernel_decision(), KernelDecision::ShareHost);

        session.config.kernel_policy = KernelPolicy::AlwaysInject;
        assert_eq!(session.kernel_decision(), KernelDecision::Inject);
    }

    #[test]
    fn test_share_host_removes_boot_image() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        session.config.kernel_policy = KernelPolicy::ShareHostKernel;
        let rom = android_rom(&session, "A");
        fs::write(rom.join("boot.img"), b"ANDROID!").unwrap();

        session.apply_kernel_decision(&rom).unwrap();
        assert!(!rom.join("boot.img").exists());
    }

    #[test]
    fn test_external_location_mounts_and_releases() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = session(dir.path(), 0);
        let loc: InstallLocation = "/dev/block/sda1 (ext4)".parse().unwrap();

        session.set_location(&loc).unwrap();
        assert_eq!(session.roms_root().path, dir.path().join("mnt/multirom"));

        session.set_location(&InstallLocation::Internal).unwrap();
        assert_eq!(
            session.roms_root().path,
            dir.path().join("multirom/roms")
        );
    }

    #[test]
    fn test_remap_package_path() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let realdata = &config.data_device.mountpoint;

        assert_eq!(
            remap_package_path(&config, Path::new("/sdcard/rom.zip")),
            realdata.join("media/rom.zip")
        );
        fs::create_dir_all(realdata.join("media/0")).unwrap();
        assert_eq!(
            remap_package_path(&config, Path::new("/sdcard/rom.zip")),
            realdata.join("media/0/rom.zip")
        );
        assert_eq!(
            remap_package_path(&config, Path::new("/data/media/0/rom.zip")),
            realdata.join("media/0/rom.zip")
        );
        assert_eq!(
            remap_package_path(&config, Path::new("/tmp/mr_update.zip")),
            PathBuf::from("/tmp/mr_update.zip")
        );
    }
}
