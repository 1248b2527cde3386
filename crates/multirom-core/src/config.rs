//! Engine configuration
//!
//! Every device constant the engine relies on lives here. The defaults match
//! the Nexus 7 (tegra3) layout; a JSON file can override any subset.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::traits::SettingsStore;

/// Setting consulted by [`KernelPolicy::InjectUnlessShared`]
pub const SHARE_KERNEL_SETTING: &str = "share_kernel";

/// How a ROM's boot image is treated after installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPolicy {
    /// Always patch the ROM's boot image with the trampoline
    AlwaysInject,
    /// Patch unless the `share_kernel` setting is on
    #[default]
    InjectUnlessShared,
    /// Never patch; the ROM boots the host kernel and keeps no boot image
    ShareHostKernel,
}

/// A [`KernelPolicy`] resolved against the current settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDecision {
    Inject,
    ShareHost,
}

impl KernelPolicy {
    pub fn resolve(&self, settings: &dyn SettingsStore) -> KernelDecision {
        match self {
            KernelPolicy::AlwaysInject => KernelDecision::Inject,
            KernelPolicy::ShareHostKernel => KernelDecision::ShareHost,
            KernelPolicy::InjectUnlessShared => {
                if settings.get_bool(SHARE_KERNEL_SETTING).unwrap_or(false) {
                    KernelDecision::ShareHost
                } else {
                    KernelDecision::Inject
                }
            }
        }
    }
}

/// The dedicated block device holding the real data partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDevice {
    pub device: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
    /// Where the device is mounted during a transaction
    pub mountpoint: PathBuf,
    /// Prefix of internal ROM paths, replaced by `mountpoint` while redirected
    pub internal_prefix: PathBuf,
}

impl Default for DataDevice {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/block/platform/sdhci-tegra.3/by-name/UDA"),
            fs_type: "ext4".to_string(),
            options: ["user_xattr", "acl", "barrier=1", "data=ordered", "discard"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mountpoint: PathBuf::from("/realdata"),
            internal_prefix: PathBuf::from("/data"),
        }
    }
}

/// Fixed scratch and mount directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchPaths {
    /// Boot image unpack area, cleared on every exit path
    pub boot_dir: PathBuf,
    /// Copy of a package small enough to be rewritten off-card
    pub package_copy: PathBuf,
    /// Where an installer stages the package's META-INF
    pub script_staging: PathBuf,
    /// Generic installer hook scripts are unpacked here
    pub hooks_dir: PathBuf,
    /// Generic installer base volumes are loop-mounted under here
    pub installer_mount: PathBuf,
    /// Foreign OS `root.img` mountpoint
    pub foreign_image_mount: PathBuf,
    /// Foreign OS source image mountpoint
    pub foreign_source_mount: PathBuf,
    /// Converted foreign OS source image
    pub foreign_source_image: PathBuf,
    /// External roms volume mountpoint
    pub external_mount: PathBuf,
}

impl Default for ScratchPaths {
    fn default() -> Self {
        Self {
            boot_dir: PathBuf::from("/tmp/boot"),
            package_copy: PathBuf::from("/tmp/mr_update.zip"),
            script_staging: PathBuf::from("/tmp/META-INF"),
            hooks_dir: PathBuf::from("/tmp/mrom_hooks"),
            installer_mount: PathBuf::from("/mnt_installer"),
            foreign_image_mount: PathBuf::from("/mnt_ubuntu"),
            foreign_source_mount: PathBuf::from("/mnt_ub_img"),
            foreign_source_image: PathBuf::from("/tmp/rootfs.img"),
            external_mount: PathBuf::from("/mnt"),
        }
    }
}

/// Default image sizes in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSizes {
    pub system_mb: i64,
    pub data_mb: i64,
    pub cache_mb: i64,
    pub root_mb: i64,
}

impl Default for VolumeSizes {
    fn default() -> Self {
        Self {
            system_mb: 640,
            data_mb: 1024,
            cache_mb: 436,
            root_mb: 4096,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidate MultiROM directories, first existing one wins
    pub multirom_dirs: Vec<PathBuf>,

    /// Directory holding the live `system`, `data` and `cache` mountpoints
    pub live_root: PathBuf,

    pub data_device: DataDevice,

    pub fstab: PathBuf,
    pub recovery_fstab: PathBuf,

    /// Lines appended to recovery.fstab after the redirected volumes
    pub recovery_fstab_tail: Vec<String>,
    /// Lines appended to fstab after the redirected volumes
    pub fstab_tail: Vec<String>,

    /// Hardware-specific block device namespace
    pub block_namespace: String,
    /// Boot partition device node
    pub boot_partition: PathBuf,
    /// Legacy boot partition node
    pub legacy_boot_node: String,

    pub scratch: ScratchPaths,

    pub max_name_len: usize,

    /// Packages at or above this size are rewritten in place
    pub package_copy_threshold_mb: u64,

    pub volume_sizes: VolumeSizes,

    pub kernel_policy: KernelPolicy,

    /// Use the host boot partition when an Android package has no boot.img
    pub boot_fallback_to_host: bool,

    /// Unmount utility renamed aside while a transaction is open
    pub unmount_guard: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let ns = "/dev/block/platform/sdhci-tegra.3/";
        Self {
            multirom_dirs: vec![
                PathBuf::from("/data/media/multirom"),
                PathBuf::from("/data/media/0/multirom"),
            ],
            live_root: PathBuf::from("/"),
            data_device: DataDevice::default(),
            fstab: PathBuf::from("/etc/fstab"),
            recovery_fstab: PathBuf::from("/etc/recovery.fstab"),
            recovery_fstab_tail: vec![
                format!("/misc\t\temmc\t\t{}by-name/MSC", ns),
                format!("/boot\t\temmc\t\t{}by-name/LNX", ns),
                format!("/recovery\t\temmc\t\t{}by-name/SOS", ns),
                format!("/staging\t\temmc\t\t{}by-name/USP", ns),
                "/usb-otg\t\tvfat\t\t/dev/block/sda1".to_string(),
            ],
            fstab_tail: vec!["/usb-otg vfat rw".to_string()],
            block_namespace: ns.to_string(),
            boot_partition: PathBuf::from(format!("{}by-name/LNX", ns)),
            legacy_boot_node: "/dev/block/mmcblk0p2".to_string(),
            scratch: ScratchPaths::default(),
            max_name_len: 26,
            package_copy_threshold_mb: 450,
            volume_sizes: VolumeSizes::default(),
            kernel_policy: KernelPolicy::default(),
            boot_fallback_to_host: false,
            unmount_guard: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_name_len == 0 {
            return Err(Error::InvalidConfig("max_name_len must be positive".to_string()));
        }

        if self.multirom_dirs.is_empty() {
            return Err(Error::InvalidConfig("no multirom_dirs configured".to_string()));
        }

        let paths = self
            .multirom_dirs
            .iter()
            .map(|p| ("multirom_dirs", p.as_path()))
            .chain([
                ("live_root", self.live_root.as_path()),
                ("data_device.device", self.data_device.device.as_path()),
                ("data_device.mountpoint", self.data_device.mountpoint.as_path()),
                ("data_device.internal_prefix", self.data_device.internal_prefix.as_path()),
                ("fstab", self.fstab.as_path()),
                ("recovery_fstab", self.recovery_fstab.as_path()),
                ("boot_partition", self.boot_partition.as_path()),
                ("scratch.boot_dir", self.scratch.boot_dir.as_path()),
                ("scratch.package_copy", self.scratch.package_copy.as_path()),
                ("scratch.script_staging", self.scratch.script_staging.as_path()),
                ("scratch.hooks_dir", self.scratch.hooks_dir.as_path()),
                ("scratch.installer_mount", self.scratch.installer_mount.as_path()),
                ("scratch.foreign_image_mount", self.scratch.foreign_image_mount.as_path()),
                ("scratch.foreign_source_mount", self.scratch.foreign_source_mount.as_path()),
                ("scratch.foreign_source_image", self.scratch.foreign_source_image.as_path()),
                ("scratch.external_mount", self.scratch.external_mount.as_path()),
            ])
            .chain(self.unmount_guard.iter().map(|p| ("unmount_guard", p.as_path())));

        for (key, path) in paths {
            if !path.is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "{} must be an absolute path, got {}",
                    key,
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// First configured MultiROM directory that exists
    pub fn multirom_dir(&self) -> Result<PathBuf> {
        self.multirom_dirs
            .iter()
            .find(|p| p.is_dir())
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "MultiROM directory (tried {})",
                    self.multirom_dirs
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Live mountpoint of a root volume (`system`, `data`, `cache`)
    pub fn live_mount(&self, volume: &str) -> PathBuf {
        self.live_root.join(volume)
    }

    pub fn package_copy_threshold(&self) -> u64 {
        self.package_copy_threshold_mb * 1024 * 1024
    }

    /// Size of a default volume image, `None` for names we have no default for
    pub fn default_volume_size(&self, name: &str) -> Option<i64> {
        match name {
            "system" => Some(self.volume_sizes.system_mb),
            "data" => Some(self.volume_sizes.data_mb),
            "cache" => Some(self.volume_sizes.cache_mb),
            "root" => Some(self.volume_sizes.root_mb),
            _ => None,
        }
    }
}
