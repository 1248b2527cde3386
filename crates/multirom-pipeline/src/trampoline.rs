//! Trampoline injection into an unpacked ramdisk

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use multirom_core::{Error, Result};

/// Name the ROM's own init is preserved under
pub const MAIN_INIT: &str = "main_init";

/// Permission bits of the installed trampoline
pub const TRAMPOLINE_MODE: u32 = 0o750;

/// Event daemon symlink repointed at the preserved init
pub const UEVENTD_LINK: &str = "sbin/ueventd";

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Install `trampoline` as the ramdisk's init
///
/// The original init is moved to [`MAIN_INIT`] unless a preserved copy is
/// already there, so running this twice never loses the original.
pub fn inject_trampoline(root: &Path, trampoline: &Path) -> Result<()> {
    let init = root.join("init");
    let main_init = root.join(MAIN_INIT);

    if !exists_no_follow(&main_init) {
        if !exists_no_follow(&init) {
            return Err(Error::not_found(format!("{} in ramdisk", init.display())));
        }
        fs::rename(&init, &main_init)?;
    } else if exists_no_follow(&init) {
        fs::remove_file(&init)?;
    }

    tracing::info!("Copying trampoline...");
    fs::copy(trampoline, &init)?;
    fs::set_permissions(&init, fs::Permissions::from_mode(TRAMPOLINE_MODE))?;

    let ueventd = root.join(UEVENTD_LINK);
    if let Some(parent) = ueventd.parent() {
        fs::create_dir_all(parent)?;
    }
    if exists_no_follow(&ueventd) {
        fs::remove_file(&ueventd)?;
    }
    symlink(format!("../{}", MAIN_INIT), &ueventd)?;

    Ok(())
}
