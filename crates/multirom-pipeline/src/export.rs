//! Export of an Android ROM's boot files
//!
//! The trampoline boots a secondary ROM from loose files in `<rom>/boot/`
//! rather than from its `boot.img`: the kernel, the compressed ramdisk, the
//! command line and the init scripts pulled out of the ramdisk.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use multirom_core::{Error, Host, Result};

use crate::bootimg::{self, BootArtifacts};
use crate::compression::CompressionKind;
use crate::cpio;
use crate::scratch::ScratchDir;
use crate::trampoline::MAIN_INIT;

/// Boot files directory inside a ROM
pub const BOOT_DIR: &str = "boot";
/// The ROM's own boot image
pub const BOOT_IMAGE: &str = "boot.img";

fn wanted_from_ramdisk(name: &str) -> bool {
    name.ends_with(".rc") || name == "default.prop" || name == "init" || name == MAIN_INIT
}

/// Unpack `<rom>/boot.img` into `<rom>/boot/`
pub fn export_boot(host: &mut dyn Host, rom_dir: &Path, scratch: &Path) -> Result<()> {
    let image = rom_dir.join(BOOT_IMAGE);
    if !image.is_file() {
        tracing::error!("ROM {} has no {}", rom_dir.display(), BOOT_IMAGE);
        return Err(Error::artifact_missing(image.display().to_string()));
    }

    let boot = rom_dir.join(BOOT_DIR);
    let artifacts = bootimg::unpack(host, &image, &boot)?;
    keep_artifacts(&boot, &artifacts)?;

    let scratch = ScratchDir::create(scratch)?;
    let compressed = fs::read(boot.join("ramdisk.gz"))?;
    let codec = CompressionKind::sniff(&compressed)?.codec()?;
    let entries = cpio::parse(&codec.decompress(&compressed)?)?;
    cpio::extract(&entries, scratch.path())?;

    if !present(&scratch.join("init")) && !present(&scratch.join(MAIN_INIT)) {
        tracing::error!("Failed to extract ramdisk of {}", image.display());
        return Err(Error::artifact_missing("init in ramdisk"));
    }

    for entry in fs::read_dir(scratch.path())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !wanted_from_ramdisk(&name) {
            continue;
        }
        let file_type = entry.file_type()?;
        let dest = boot.join(&name);
        if file_type.is_symlink() {
            if present(&dest) {
                fs::remove_file(&dest)?;
            }
            symlink(fs::read_link(entry.path())?, &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        }
    }

    let main_init = boot.join(MAIN_INIT);
    if !present(&main_init) {
        let init = boot.join("init");
        if !present(&init) {
            tracing::error!("Ramdisk of {} has no usable init", image.display());
            return Err(Error::artifact_missing(init.display().to_string()));
        }
        fs::rename(init, &main_init)?;
    }

    tracing::debug!("Exported boot files of {}", rom_dir.display());
    Ok(())
}

/// Exists, without following a final symlink
fn present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Rename the artifacts without the image prefix and drop the rest
fn keep_artifacts(boot: &Path, artifacts: &BootArtifacts) -> Result<()> {
    fs::rename(&artifacts.kernel, boot.join("zImage"))?;
    fs::rename(&artifacts.ramdisk, boot.join("ramdisk.gz"))?;
    if artifacts.cmdline.is_file() {
        fs::rename(&artifacts.cmdline, boot.join("cmdline"))?;
    }

    let prefix = format!("{}-", BOOT_IMAGE);
    for entry in fs::read_dir(boot)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::CpioEntry;
    use multirom_core::{CommandResult, RecordingHost};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn unpacking_host(ramdisk: Vec<u8>) -> RecordingHost {
        let mut host = RecordingHost::new();
        host.on("unpackbootimg", move |cmd| {
            let args = cmd.get_args();
            let a = BootArtifacts::locate(Path::new(&args[3]), Path::new(&args[1]));
            fs::write(&a.kernel, b"kernel")?;
            fs::write(&a.ramdisk, &ramdisk)?;
            fs::write(&a.cmdline, b"quiet\n")?;
            fs::write(&a.base, b"10000000\n")?;
            fs::write(a.kernel.with_file_name("boot.img-pagesize"), b"2048\n")?;
            Ok(CommandResult::ok())
        });
        host
    }

    #[test]
    fn test_export_boot() {
        let dir = TempDir::new().unwrap();
        let rom = dir.path().join("MyROM");
        fs::create_dir_all(&rom).unwrap();
        fs::write(rom.join("boot.img"), b"ANDROID!").unwrap();

        let archive = cpio::write(&[
            CpioEntry::file("init", 0o750, b"init".to_vec()),
            CpioEntry::file("init.rc", 0o644, b"on boot".to_vec()),
            CpioEntry::file("default.prop", 0o644, b"ro.secure=0".to_vec()),
            CpioEntry::file("fstab.grouper", 0o644, b"".to_vec()),
        ]);
        let gz = CompressionKind::Gzip.codec().unwrap().compress(&archive).unwrap();
        let mut host = unpacking_host(gz);

        export_boot(&mut host, &rom, &dir.path().join("scratch")).unwrap();

        let boot = rom.join("boot");
        let mut names: Vec<String> = fs::read_dir(&boot)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["cmdline", "default.prop", "init.rc", "main_init", "ramdisk.gz", "zImage"]
        );
        assert_eq!(fs::read(boot.join("main_init")).unwrap(), b"init");
        assert!(!dir.path().join("scratch").exists());
        assert!(rom.join("boot.img").exists());
    }

    #[test]
    fn test_export_keeps_symlinked_init() {
        let dir = TempDir::new().unwrap();
        let rom = dir.path().join("MyROM");
        fs::create_dir_all(&rom).unwrap();
        fs::write(rom.join("boot.img"), b"ANDROID!").unwrap();

        let archive = cpio::write(&[
            CpioEntry::file("init.rc", 0o644, b"on boot".to_vec()),
            CpioEntry::directory("system", 0o755),
            CpioEntry::symlink("init", "system/bin/init"),
        ]);
        let gz = CompressionKind::Gzip.codec().unwrap().compress(&archive).unwrap();
        let mut host = unpacking_host(gz);

        export_boot(&mut host, &rom, &dir.path().join("scratch")).unwrap();

        let main_init = rom.join("boot/main_init");
        assert!(fs::symlink_metadata(&main_init).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&main_init).unwrap(), PathBuf::from("system/bin/init"));
        assert!(fs::symlink_metadata(rom.join("boot/init")).is_err());
    }

    #[test]
    fn test_export_requires_boot_image() {
        let dir = TempDir::new().unwrap();
        let mut host = RecordingHost::new();
        let err = export_boot(&mut host, dir.path(), &PathBuf::from("/nonexistent")).unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));
        assert!(!host.ran("unpackbootimg"));
    }
}
