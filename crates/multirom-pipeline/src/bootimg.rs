//! Boot image unpack and repack through `unpackbootimg` / `mkbootimg`
//!
//! The tools' exit status is not trusted: each step checks that its output
//! actually exists.

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{Cmd, Error, Host, Result};

/// The artifact group `unpackbootimg` writes for one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArtifacts {
    pub kernel: PathBuf,
    pub ramdisk: PathBuf,
    pub cmdline: PathBuf,
    pub base: PathBuf,
}

impl BootArtifacts {
    /// Artifact paths for `image` unpacked into `dir`
    ///
    /// Files are named after the image, e.g. `boot.img-zImage`.
    pub fn locate(dir: &Path, image: &Path) -> Self {
        let prefix = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "boot.img".to_string());
        Self {
            kernel: dir.join(format!("{}-zImage", prefix)),
            ramdisk: dir.join(format!("{}-ramdisk.gz", prefix)),
            cmdline: dir.join(format!("{}-cmdline", prefix)),
            base: dir.join(format!("{}-base", prefix)),
        }
    }
}

/// Unpack `image` into `dir`
pub fn unpack(host: &mut dyn Host, image: &Path, dir: &Path) -> Result<BootArtifacts> {
    tracing::info!("Extracting boot image...");
    fs::create_dir_all(dir)?;

    let mut out_dir = dir.as_os_str().to_owned();
    out_dir.push("/");
    host.run(
        &Cmd::new("unpackbootimg")
            .arg("-i")
            .arg_path(image)
            .arg("-o")
            .arg_path(Path::new(&out_dir)),
    )?;

    let artifacts = BootArtifacts::locate(dir, image);
    if !artifacts.kernel.is_file() {
        tracing::error!("Failed to unpack boot image {}", image.display());
        return Err(Error::artifact_missing(artifacts.kernel.display().to_string()));
    }
    if !artifacts.ramdisk.is_file() {
        tracing::error!("Boot image {} has no ramdisk", image.display());
        return Err(Error::artifact_missing(artifacts.ramdisk.display().to_string()));
    }

    Ok(artifacts)
}

fn read_value(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Build a boot image at `output` from an artifact group
pub fn repack(host: &mut dyn Host, artifacts: &BootArtifacts, output: &Path) -> Result<()> {
    tracing::info!("Packing boot image");

    let cmdline = read_value(&artifacts.cmdline)?;
    let base = read_value(&artifacts.base)?;

    let mut cmd = Cmd::new("mkbootimg")
        .arg("--kernel")
        .arg_path(&artifacts.kernel)
        .arg("--ramdisk")
        .arg_path(&artifacts.ramdisk)
        .arg("--cmdline")
        .arg(&cmdline);
    if !base.is_empty() {
        cmd = cmd.arg("--base").arg(&base);
    }
    cmd = cmd.arg("--output").arg_path(output);

    host.run(&cmd)?;

    if !output.is_file() {
        tracing::error!("Failed to pack boot image");
        return Err(Error::artifact_missing(output.display().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multirom_core::{CommandResult, RecordingHost};
    use tempfile::TempDir;

    #[test]
    fn test_locate_uses_image_name() {
        let a = BootArtifacts::locate(Path::new("/tmp/boot"), Path::new("/roms/A/boot.img"));
        assert_eq!(a.kernel, PathBuf::from("/tmp/boot/boot.img-zImage"));
        assert_eq!(a.ramdisk, PathBuf::from("/tmp/boot/boot.img-ramdisk.gz"));

        let a = BootArtifacts::locate(Path::new("/tmp/boot"), Path::new("/dev/block/by-name/LNX"));
        assert_eq!(a.base, PathBuf::from("/tmp/boot/LNX-base"));
    }

    #[test]
    fn test_unpack_requires_kernel() {
        let dir = TempDir::new().unwrap();
        let mut host = RecordingHost::new();
        let err = unpack(&mut host, Path::new("/x/boot.img"), dir.path()).unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));
        assert!(host.ran("unpackbootimg"));
    }

    #[test]
    fn test_repack_passes_file_values() {
        let dir = TempDir::new().unwrap();
        let artifacts = BootArtifacts::locate(dir.path(), Path::new("boot.img"));
        fs::write(&artifacts.cmdline, "androidboot.selinux=permissive quiet\n").unwrap();
        fs::write(&artifacts.base, "10000000\n").unwrap();
        let output = dir.path().join("newboot.img");

        let mut host = RecordingHost::new();
        let out = output.clone();
        host.on("mkbootimg", move |_| {
            fs::write(&out, b"ANDROID!")?;
            Ok(CommandResult::ok())
        });
        repack(&mut host, &artifacts, &output).unwrap();

        let cmd = host.commands()[0].clone();
        let args = cmd.get_args();
        let pos = args.iter().position(|a| a == "--cmdline").unwrap();
        assert_eq!(args[pos + 1], "androidboot.selinux=permissive quiet");
        let pos = args.iter().position(|a| a == "--base").unwrap();
        assert_eq!(args[pos + 1], "10000000");
    }

    #[test]
    fn test_repack_checks_output() {
        let dir = TempDir::new().unwrap();
        let artifacts = BootArtifacts::locate(dir.path(), Path::new("boot.img"));
        let mut host = RecordingHost::new();
        let err = repack(&mut host, &artifacts, &dir.path().join("newboot.img")).unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));
    }
}
