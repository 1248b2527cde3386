//! Storage layout creation
//!
//! A ROM's volumes are either plain directories or zero-filled ext4 image
//! files formatted with `make_ext4fs`.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use multirom_core::{
    BaseFolder, Cmd, Error, Host, OsKind, Result, RomKind, StorageRoot, Substrate, Volume,
    VolumeBacking,
};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

/// Permission bits of the Android directory volumes
pub const ANDROID_DIR_MODES: &[(&str, u32)] = &[
    ("system", 0o755),
    ("data", 0o771),
    ("cache", 0o770),
];

/// Permission bits of the boot artifact folder and base-folder directories
pub const OPEN_DIR_MODE: u32 = 0o777;

const ZERO_CHUNK: usize = 1024 * 1024;

/// Describe the volumes of a new ROM
///
/// Android directory ROMs get the fixed system/data/cache set; every other
/// kind is built from `base_folders`, as directories or images depending on
/// the substrate. Android ROMs always get a `boot` directory.
pub fn plan_layout(kind: RomKind, base: &Path, base_folders: &[BaseFolder]) -> StorageRoot {
    let mut root = StorageRoot::new(base);

    if kind.has_boot_folder() {
        root = root.with_volume(Volume::directory("boot", OPEN_DIR_MODE));
    }

    match (kind.os_kind(), kind.substrate()) {
        (OsKind::Android, Substrate::Directory) => {
            for (name, mode) in ANDROID_DIR_MODES {
                root = root.with_volume(Volume::directory(*name, *mode));
            }
        }
        (_, Substrate::Directory) => {
            for folder in base_folders {
                root = root.with_volume(Volume::directory(&folder.name, OPEN_DIR_MODE));
            }
        }
        (_, Substrate::Image) => {
            for folder in base_folders {
                root = root.with_volume(Volume::image(&folder.name, folder.size_mb));
            }
        }
    }

    root
}

/// Create the ROM directory and every planned volume
///
/// The ROM directory itself must not exist yet.
pub fn create_layout(host: &mut dyn Host, root: &StorageRoot) -> Result<()> {
    if root.base.exists() {
        return Err(Error::AlreadyExists(root.base.display().to_string()));
    }

    create_dir_mode(&root.base, OPEN_DIR_MODE).map_err(|e| {
        tracing::error!("Failed to create ROM folder {}: {}", root.base.display(), e);
        e
    })?;

    for volume in &root.volumes {
        let path = root.base.join(volume.file_name());
        match volume.backing {
            VolumeBacking::Directory { mode } => {
                create_dir_mode(&path, mode).map_err(|e| {
                    tracing::error!("Failed to create folder {}: {}", path.display(), e);
                    e
                })?;
            }
            VolumeBacking::Image { size_mb } => create_image(host, &path, size_mb)?,
        }
    }

    Ok(())
}

fn create_dir_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        fs::DirBuilder::new().mode(mode).create(path)?;
        // mkdir honors the umask, the folders need the exact bits
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::create_dir(path)?;
    }
    Ok(())
}

/// Zero-fill an image of `size_mb` MiB and format it as ext4
pub fn create_image(host: &mut dyn Host, path: &Path, size_mb: i64) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracing::info!("Creating {}...", name);

    if size_mb <= 0 {
        tracing::error!("Failed to create {}: invalid size ({})", name, size_mb);
        return Err(Error::custom(format!(
            "invalid image size {} for {}",
            size_mb, name
        )));
    }

    if let Err(e) = zero_fill(path, size_mb as u64) {
        tracing::error!(
            "Failed to create {}, probably not enough space: {}",
            name,
            e
        );
        let _ = fs::remove_file(path);
        return Err(e);
    }

    if !path.is_file() {
        tracing::error!("Failed to create {}, probably not enough space", name);
        return Err(Error::artifact_missing(path.display().to_string()));
    }

    host.run(
        &Cmd::new("make_ext4fs")
            .arg("-l")
            .arg(format!("{}M", size_mb))
            .arg_path(path),
    )?;

    Ok(())
}

fn zero_fill(path: &Path, size_mb: u64) -> Result<()> {
    let mut file = File::create(path)?;
    let chunk = vec![0u8; ZERO_CHUNK];
    for _ in 0..size_mb {
        file.write_all(&chunk)?;
    }
    file.sync_all()?;
    Ok(())
}
