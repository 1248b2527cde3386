//! The boot image patch pipeline
//!
//! unpack → sniff → decompress → inject → recompress → repack → write back.
//! Everything up to the final write happens in a [`ScratchDir`], so a failure
//! at any stage leaves the destination as it was.

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::{Error, Host, Result};

use crate::bootimg;
use crate::compression::CompressionKind;
use crate::cpio;
use crate::scratch::ScratchDir;
use crate::trampoline::inject_trampoline;
use crate::verify::write_image;

/// Directory inside the scratch area the ramdisk is unpacked into
const RAMDISK_DIR: &str = "rd";
/// Repacked image inside the scratch area
const REPACKED_IMAGE: &str = "newboot.img";

/// Injects the trampoline into boot images
#[derive(Debug, Clone)]
pub struct BootPatcher {
    scratch: PathBuf,
    trampoline: PathBuf,
}

impl BootPatcher {
    pub fn new(scratch: impl Into<PathBuf>, trampoline: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
            trampoline: trampoline.into(),
        }
    }

    pub fn trampoline(&self) -> &Path {
        &self.trampoline
    }

    /// Patch a boot image file or partition node in place
    pub fn patch(&self, host: &mut dyn Host, image: &Path) -> Result<()> {
        self.patch_to(host, image, image)
    }

    /// Patch `image` and write the result to `dest`
    pub fn patch_to(&self, host: &mut dyn Host, image: &Path, dest: &Path) -> Result<()> {
        if !self.trampoline.is_file() {
            tracing::error!("Couldn't find trampoline at {}", self.trampoline.display());
            return Err(Error::not_found(self.trampoline.display().to_string()));
        }

        let scratch = ScratchDir::create(&self.scratch)?;
        let result = self.run(host, &scratch, image, dest);
        if let Err(e) = &result {
            tracing::error!("Failed to inject trampoline into {}: {}", image.display(), e);
        }
        result
    }

    fn run(
        &self,
        host: &mut dyn Host,
        scratch: &ScratchDir,
        image: &Path,
        dest: &Path,
    ) -> Result<()> {
        let artifacts = bootimg::unpack(host, image, scratch.path())?;

        let compressed = fs::read(&artifacts.ramdisk)?;
        let kind = CompressionKind::sniff(&compressed)?;
        let codec = kind.codec()?;
        if !codec.can_compress() {
            tracing::error!("{} ramdisk cannot be repacked", kind);
            return Err(Error::unsupported_compression(format!(
                "{} recompression",
                kind
            )));
        }

        tracing::info!("Extracting ramdisk...");
        let entries = cpio::parse(&codec.decompress(&compressed)?)?;
        let root = scratch.join(RAMDISK_DIR);
        cpio::extract(&entries, &root)?;
        if !root.join("init").exists() {
            tracing::error!("Ramdisk has no init");
            return Err(Error::artifact_missing(format!("{}/init", root.display())));
        }

        inject_trampoline(&root, &self.trampoline)?;

        tracing::info!("Packing ramdisk...");
        let archive = cpio::write(&cpio::collect_over(&root, &entries)?);
        fs::write(&artifacts.ramdisk, codec.compress(&archive)?)?;

        let repacked = scratch.join(REPACKED_IMAGE);
        bootimg::repack(host, &artifacts, &repacked)?;

        write_image(&repacked, dest)?;
        host.sync();
        tracing::info!("Boot image {} patched", dest.display());
        Ok(())
    }
}
