//! Generic installer packages
//!
//! A zip with a `manifest.txt`, optional hook script directories, an optional
//! directory copied into the ROM root and per-base-folder tarballs under
//! `rom/`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use multirom_core::{BaseFolder, Cmd, Error, Host, Result, MAX_SCRIPT_SIZE};

use crate::archive::Package;
use crate::manifest::{Manifest, MANIFEST_NAME};
use crate::tarball::unpack_tar_gz;

/// Directory holding base folder tarballs
const TARBALL_DIR: &str = "rom/";

/// When a hook directory runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreInstall,
    PostInstall,
}

impl HookStage {
    fn label(&self) -> &'static str {
        match self {
            HookStage::PreInstall => "pre_install",
            HookStage::PostInstall => "post_install",
        }
    }
}

/// An opened generic installer package
#[derive(Debug)]
pub struct InstallerPackage {
    package: Package,
    manifest: Manifest,
}

/// Whether `entry` is `rom/<base>.tar.gz` or `rom/<base>_NN.tar.gz`
fn is_tarball_for(entry: &str, base: &str) -> bool {
    let Some(stem) = entry
        .strip_prefix(TARBALL_DIR)
        .and_then(|n| n.strip_suffix(".tar.gz"))
    else {
        return false;
    };
    if stem == base {
        return true;
    }
    match stem.strip_prefix(base).and_then(|r| r.strip_prefix('_')) {
        Some(part) => !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

impl InstallerPackage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut package = Package::open(path)?;
        if !package.has_entry(MANIFEST_NAME) {
            tracing::error!("{} has no {}", path.display(), MANIFEST_NAME);
            return Err(Error::invalid_manifest(format!(
                "{} not found in {}",
                MANIFEST_NAME,
                path.display()
            )));
        }
        let text = package.read_entry(MANIFEST_NAME, MAX_SCRIPT_SIZE)?;
        let manifest = Manifest::parse(&String::from_utf8_lossy(&text))?;
        Ok(Self { package, manifest })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        self.package.path()
    }

    /// Run every script of a hook directory as `<script> <base> <root>`
    ///
    /// Scripts run in name order from `hooks_dir`, which is recreated for
    /// the purpose and removed afterwards.
    pub fn run_hooks(
        &mut self,
        host: &mut dyn Host,
        stage: HookStage,
        hooks_dir: &Path,
        base: &Path,
        root: &Path,
    ) -> Result<()> {
        let dir = match stage {
            HookStage::PreInstall => self.manifest.pre_install(),
            HookStage::PostInstall => self.manifest.post_install(),
        };
        let Some(dir) = dir.map(str::to_string) else {
            return Ok(());
        };

        if hooks_dir.exists() {
            fs::remove_dir_all(hooks_dir)?;
        }
        let result = self.run_hooks_in(host, stage, &dir, hooks_dir, base, root);
        if let Err(e) = fs::remove_dir_all(hooks_dir) {
            tracing::warn!("Failed to remove {}: {}", hooks_dir.display(), e);
        }
        result
    }

    fn run_hooks_in(
        &mut self,
        host: &mut dyn Host,
        stage: HookStage,
        dir: &str,
        hooks_dir: &Path,
        base: &Path,
        root: &Path,
    ) -> Result<()> {
        self.package.extract_dir(dir, hooks_dir)?;

        let mut scripts: Vec<PathBuf> = fs::read_dir(hooks_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        scripts.sort();

        for script in scripts {
            tracing::info!(
                "Running {} script {}...",
                stage.label(),
                script.file_name().unwrap_or_default().to_string_lossy()
            );
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
            host.run(
                &Cmd::new(script.to_string_lossy())
                    .arg_path(base)
                    .arg_path(root),
            )
            .map_err(|e| {
                tracing::error!("Script {} failed: {}", script.display(), e);
                e
            })?;
        }
        Ok(())
    }

    /// Extract the manifest's `root_dir` into the ROM root, if declared
    pub fn extract_root(&mut self, root: &Path) -> Result<()> {
        let Some(dir) = self.manifest.root_dir().map(str::to_string) else {
            return Ok(());
        };
        tracing::info!("Extracting {}...", dir);
        self.package.extract_dir(&dir, root)?;
        Ok(())
    }

    /// Extract each base folder's tarballs into `<base>/<folder>`
    pub fn extract_tarballs(
        &mut self,
        base: &Path,
        folders: &[BaseFolder],
        preserve_owner: bool,
    ) -> Result<()> {
        let names = self.package.entry_names();
        for folder in folders {
            let mut tarballs: Vec<&String> = names
                .iter()
                .filter(|n| is_tarball_for(n, &folder.name))
                .collect();
            tarballs.sort();

            if tarballs.is_empty() {
                tracing::info!("No tarballs for {}", folder.name);
                continue;
            }

            let dest = base.join(&folder.name);
            for tarball in tarballs {
                tracing::info!("Extracting {}...", tarball);
                self.package
                    .with_entry(tarball, |r| unpack_tar_gz(r, &dest, preserve_owner))
                    .map_err(|e| {
                        tracing::error!("Failed to extract {}: {}", tarball, e);
                        e
                    })?;
            }
        }
        Ok(())
    }
}
