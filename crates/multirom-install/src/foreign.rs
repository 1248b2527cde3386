//! Foreign OS (Ubuntu) installation
//!
//! The root filesystem ships as a sparse image holding `rootfs.tar.gz`.
//! After extraction the initramfs scripts are replaced with MultiROM's own
//! and the initramfs is regenerated inside a chroot.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use multirom_core::{Cmd, Error, Host, KernelDecision, MountRequest, OsKind, Result, Substrate};
use multirom_package::unpack_tar_gz_file;
use multirom_pipeline::BOOT_IMAGE;

use crate::session::MultiRom;

/// Directories bound into the chroot
const CHROOT_BINDS: [&str; 3] = ["dev", "sys", "proc"];

const ROOTFS_TARBALL: &str = "rootfs.tar.gz";
const KERNEL: &str = "boot/vmlinuz";
const FSTAB_LINE: &str = "none\t /proc \tproc \tnodev,noexec,nosuid \t0 \t0\n";
const FLASH_KERNEL_SKIP: &str = "FLASH_KERNEL_SKIP=1";

fn chroot(root: &Path) -> Cmd {
    Cmd::new("chroot").arg_path(root)
}

/// Gunzip `*.img.gz` next to itself, returning the image to convert
fn decompressed_image(image: &Path) -> Result<PathBuf> {
    if image.extension().map_or(true, |e| e != "gz") {
        return Ok(image.to_path_buf());
    }

    let raw = image.with_extension("");
    tracing::info!("Decompressing the image (may take a while)...");
    let mut decoder = GzDecoder::new(File::open(image)?);
    let mut out = File::create(&raw)?;
    if let Err(e) = io::copy(&mut decoder, &mut out) {
        tracing::error!("Failed to decompress the image: {}", e);
        let _ = fs::remove_file(&raw);
        return Err(Error::invalid_archive(format!("{}: {}", image.display(), e)));
    }
    Ok(raw)
}

fn install_file(src: &Path, dest_dir: &Path) -> Result<()> {
    let name = src
        .file_name()
        .ok_or_else(|| Error::not_found(src.display().to_string()))?;
    let dest = dest_dir.join(name);
    fs::copy(src, &dest).map_err(|e| {
        tracing::error!("Failed to copy {}: {}", src.display(), e);
        e
    })?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Point `boot/initrd.img` at the first `boot/initrd.img-*`
fn link_initrd(root: &Path) -> Result<()> {
    let boot = root.join("boot");
    let mut initrds: Vec<String> = fs::read_dir(&boot)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("initrd.img-"))
        .collect();
    initrds.sort();

    let Some(target) = initrds.first() else {
        tracing::error!("No initrd.img-* in {}", boot.display());
        return Err(Error::artifact_missing(boot.join("initrd.img-*").display().to_string()));
    };

    let link = boot.join("initrd.img");
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    symlink(target, &link)?;
    Ok(())
}

fn append_flash_kernel_skip(root: &Path) -> Result<()> {
    let env = root.join("etc/environment");
    let current = match fs::read_to_string(&env) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if current.contains("FLASH_KERNEL_SKIP") {
        return Ok(());
    }

    if let Some(parent) = env.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&env)?;
    if !current.is_empty() && !current.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{}", FLASH_KERNEL_SKIP)?;
    Ok(())
}

/// Bind the host's dev, sys and proc into `root` for the duration of `f`
fn with_chroot<T>(
    host: &mut dyn Host,
    root: &Path,
    f: impl FnOnce(&mut dyn Host) -> Result<T>,
) -> Result<T> {
    let mut bound = Vec::new();
    let mut result = Ok(());
    for dir in CHROOT_BINDS {
        let target = root.join(dir);
        let mounted = fs::create_dir_all(&target)
            .map_err(Error::from)
            .and_then(|_| host.mount(&MountRequest::bind(Path::new("/").join(dir), &target)));
        match mounted {
            Ok(()) => bound.push(target),
            Err(e) => {
                tracing::error!("Failed to bind /{} into {}: {}", dir, root.display(), e);
                result = Err(e);
                break;
            }
        }
    }

    let result = result.and_then(|_| f(host));

    for target in bound.iter().rev() {
        if let Err(e) = host.unmount(target) {
            tracing::warn!("Failed to unmount {}: {}", target.display(), e);
        }
    }
    result
}

fn disable_flash_kernel_in(host: &mut dyn Host, root: &Path) -> Result<()> {
    tracing::info!("Disabling flash-kernel");
    host.run(
        &chroot(root)
            .args(["bash", "-c", "echo flash-kernel hold | dpkg --set-selections"])
            .allow_fail(),
    )?;
    append_flash_kernel_skip(root)
}

impl MultiRom {
    /// Extract, patch and regenerate a foreign OS root, then attach its boot image
    pub(crate) fn install_foreign(
        &mut self,
        rom_dir: &Path,
        substrate: Substrate,
        image: &Path,
        boot_image: Option<&Path>,
    ) -> Result<()> {
        let dest = self.foreign_root(rom_dir, substrate)?;

        let result = self
            .extract_rootfs(image, &dest)
            .and_then(|_| self.patch_foreign_init(&dest))
            .and_then(|_| self.update_initramfs(&dest))
            .and_then(|_| self.finish_foreign(rom_dir, &dest));

        self.release_foreign_root(substrate);
        result?;

        match boot_image {
            Some(boot) => self.attach_boot_image(rom_dir, boot),
            None => Ok(()),
        }
    }

    /// Root filesystem of a foreign ROM, mounting `root.img` when image-backed
    fn foreign_root(&mut self, rom_dir: &Path, substrate: Substrate) -> Result<PathBuf> {
        match substrate {
            Substrate::Directory => Ok(rom_dir.join("root")),
            Substrate::Image => {
                let mnt = self.config.scratch.foreign_image_mount.clone();
                fs::create_dir_all(&mnt)?;
                if self.host.is_mounted(&mnt) {
                    self.host.unmount(&mnt)?;
                }
                self.host
                    .mount(&MountRequest::loop_image(rom_dir.join("root.img"), &mnt).fs_type("ext4"))
                    .map_err(|e| {
                        tracing::error!("Failed to mount ubuntu image: {}", e);
                        e
                    })?;
                Ok(mnt)
            }
        }
    }

    fn release_foreign_root(&mut self, substrate: Substrate) {
        if substrate != Substrate::Image {
            return;
        }
        let mnt = &self.config.scratch.foreign_image_mount;
        self.host.sync();
        if let Err(e) = self.host.unmount(mnt) {
            tracing::warn!("Failed to unmount {}: {}", mnt.display(), e);
        }
    }

    /// Unpack the image's `rootfs.tar.gz` into `dest`
    fn extract_rootfs(&mut self, image: &Path, dest: &Path) -> Result<()> {
        tracing::info!("Extracting rootfs.img...");
        let image = decompressed_image(image)?;
        let mnt = self.config.scratch.foreign_source_mount.clone();
        let raw = self.config.scratch.foreign_source_image.clone();

        fs::create_dir_all(&mnt)?;
        if self.host.is_mounted(&mnt) {
            self.host.unmount(&mnt)?;
        }

        self.host
            .run(&Cmd::new("simg2img").arg_path(&image).arg_path(&raw))?;
        if !raw.is_file() {
            tracing::error!("Failed to convert {}", image.display());
            return Err(Error::artifact_missing(raw.display().to_string()));
        }

        if let Err(e) = self
            .host
            .mount(&MountRequest::loop_image(&raw, &mnt).fs_type("ext4"))
        {
            tracing::error!("Failed to mount {}: {}", raw.display(), e);
            let _ = fs::remove_file(&raw);
            return Err(e);
        }

        let tarball = mnt.join(ROOTFS_TARBALL);
        let result = if tarball.is_file() {
            unpack_tar_gz_file(&tarball, dest, self.preserve_ownership).map(|_| ())
        } else {
            tracing::error!("{} not found in the image", ROOTFS_TARBALL);
            Err(Error::artifact_missing(tarball.display().to_string()))
        };

        self.host.sync();
        if let Err(e) = self.host.unmount(&mnt) {
            tracing::warn!("Failed to unmount {}: {}", mnt.display(), e);
        }
        if let Err(e) = fs::remove_file(&raw) {
            tracing::warn!("Failed to remove {}: {}", raw.display(), e);
        }
        result?;

        if !dest.join(KERNEL).exists() {
            tracing::error!("Failed to extract rootfs!");
            return Err(Error::artifact_missing(dest.join(KERNEL).display().to_string()));
        }
        Ok(())
    }

    /// Replace the initramfs init scripts and the fstab of a foreign root
    fn patch_foreign_init(&mut self, root: &Path) -> Result<()> {
        tracing::info!("Patching ubuntu init...");
        let tools = root.join("usr/share/initramfs-tools");
        let scripts = tools.join("scripts");
        if !tools.is_dir() || !scripts.is_dir() {
            tracing::error!("init paths do not exist");
            return Err(Error::artifact_missing(scripts.display().to_string()));
        }

        let init_dir = self.multirom_dir.join("ubuntu-init");
        install_file(&init_dir.join("init"), &tools)?;
        install_file(&init_dir.join("local"), &scripts)?;

        fs::write(root.join("etc/fstab"), FSTAB_LINE)?;
        Ok(())
    }

    fn update_initramfs(&mut self, root: &Path) -> Result<()> {
        tracing::info!("Removing tarball installer...");
        with_chroot(&mut *self.host, root, |host| {
            host.run(
                &chroot(root)
                    .args(["apt-get", "-y", "--force-yes", "purge"])
                    .args(["ac100-tarball-installer", "flash-kernel"])
                    .allow_fail(),
            )?;
            disable_flash_kernel_in(host, root)?;

            tracing::info!("Updating initramfs...");
            host.run(&chroot(root).args(["update-initramfs", "-u"]))?;
            link_initrd(root)
        })
    }

    fn finish_foreign(&mut self, rom_dir: &Path, root: &Path) -> Result<()> {
        let oem = root.join("var/lib/oem-config");
        fs::create_dir_all(&oem)?;
        File::create(oem.join("run"))?;

        let info = self.multirom_dir.join("infos/ubuntu.txt");
        if info.is_file() {
            fs::copy(&info, rom_dir.join("rom_info.txt"))?;
        }
        Ok(())
    }

    /// Copy a kernel boot image into the ROM, patched per the kernel policy
    fn attach_boot_image(&mut self, rom_dir: &Path, boot: &Path) -> Result<()> {
        if self.kernel_decision() == KernelDecision::ShareHost {
            tracing::info!("Sharing the host kernel, {} not used", boot.display());
            return Ok(());
        }
        let dest = rom_dir.join(BOOT_IMAGE);
        fs::copy(boot, &dest).map_err(|e| {
            tracing::error!("Failed to copy {}: {}", boot.display(), e);
            e
        })?;
        self.inject_boot(&dest)
    }

    /// Installed foreign ROM directory and substrate
    fn foreign_rom(&self, name: &str) -> Result<(PathBuf, Substrate)> {
        let path = self.existing_rom(name)?;
        let kind = self.describe(name).require_kind()?;
        if kind.os_kind() != OsKind::ForeignOs {
            tracing::error!("ROM {} is not a foreign OS ROM ({})", name, kind);
            return Err(Error::custom(format!("{} is {}, not a foreign OS", name, kind)));
        }
        Ok((path, kind.substrate()))
    }

    /// Re-run the init patch and initramfs regeneration on an installed ROM
    pub fn patch_init(&mut self, name: &str) -> Result<()> {
        let (rom_dir, substrate) = self.foreign_rom(name)?;
        let root = self.foreign_root(&rom_dir, substrate)?;
        let result = self
            .patch_foreign_init(&root)
            .and_then(|_| self.update_initramfs(&root));
        self.release_foreign_root(substrate);
        result
    }

    /// Stop the ROM's flash-kernel from ever rewriting the boot partition
    pub fn disable_flash_kernel(&mut self, name: &str) -> Result<()> {
        let (rom_dir, substrate) = self.foreign_rom(name)?;
        let root = self.foreign_root(&rom_dir, substrate)?;
        let result = with_chroot(&mut *self.host, &root, |host| {
            host.run(
                &chroot(&root)
                    .args(["apt-get", "-y", "--force-yes", "purge", "flash-kernel"])
                    .allow_fail(),
            )?;
            disable_flash_kernel_in(host, &root)
        });
        self.host.sync();
        self.release_foreign_root(substrate);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multirom_core::{HostEvent, RecordingHost};
    use tempfile::TempDir;

    #[test]
    fn test_link_initrd_picks_first() {
        let dir = TempDir::new().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("initrd.img-3.1.10-9"), b"").unwrap();
        fs::write(boot.join("initrd.img-3.1.10-8"), b"").unwrap();
        fs::write(boot.join("initrd.img"), b"stale").unwrap();

        link_initrd(dir.path()).unwrap();
        assert_eq!(
            fs::read_link(boot.join("initrd.img")).unwrap(),
            PathBuf::from("initrd.img-3.1.10-8")
        );
    }

    #[test]
    fn test_link_initrd_missing() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("boot")).unwrap();
        assert!(matches!(link_initrd(dir.path()), Err(Error::ArtifactMissing(_))));
    }

    #[test]
    fn test_flash_kernel_skip_appended_once() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/environment"), "PATH=\"/usr/bin\"").unwrap();

        append_flash_kernel_skip(dir.path()).unwrap();
        append_flash_kernel_skip(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/environment")).unwrap(),
            "PATH=\"/usr/bin\"\nFLASH_KERNEL_SKIP=1\n"
        );
    }

    #[test]
    fn test_chroot_unbinds_on_failure() {
        let dir = TempDir::new().unwrap();
        let mut host = RecordingHost::new();
        let err = with_chroot(&mut host, dir.path(), |host| {
            host.run(&chroot(dir.path()).args(["update-initramfs", "-u"]))?;
            Err::<(), _>(Error::custom("update-initramfs failed"))
        });
        assert!(err.is_err());
        assert!(host.mounted().is_empty());
        let unmounts = host
            .events()
            .iter()
            .filter(|e| matches!(e, HostEvent::Unmount(_)))
            .count();
        assert_eq!(unmounts, 3);
    }

    #[test]
    fn test_bind_failure_unwinds() {
        let dir = TempDir::new().unwrap();
        let mut host = RecordingHost::new();
        host.fail_mount(dir.path().join("sys"));

        let mut ran = false;
        let result = with_chroot(&mut host, dir.path(), |_| {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn test_decompressed_image() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("ubuntu.img");
        fs::write(&plain, b"sparse").unwrap();
        assert_eq!(decompressed_image(&plain).unwrap(), plain);

        let gz = dir.path().join("touch.img.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"sparse image").unwrap();
        fs::write(&gz, enc.finish().unwrap()).unwrap();

        let raw = decompressed_image(&gz).unwrap();
        assert_eq!(raw, dir.path().join("touch.img"));
        assert_eq!(fs::read(&raw).unwrap(), b"sparse image");
    }
}
