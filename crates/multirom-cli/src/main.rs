//! MultiROM CLI - multi-boot management from recovery
//!
//! Adds, flashes, wipes and maintains secondary ROMs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use multirom_core::{
    EngineConfig, Host, KernelPolicy, MemorySettings, RecordingHost, SettingValue, SettingsStore,
    SystemHost, SHARE_KERNEL_SETTING,
};
use multirom_install::{AddRequest, MultiRom, RomSource, WipeTarget};
use multirom_layout::InstallLocation;
use multirom_package::{Package, UpdateBinaryInstaller, MANIFEST_NAME};

#[derive(Parser)]
#[command(name = "multirom")]
#[command(about = "Install and manage secondary ROMs for MultiROM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON engine configuration
    #[arg(long, env = "MULTIROM_CONFIG")]
    config: Option<PathBuf>,

    /// MultiROM directory, instead of the first configured one that exists
    #[arg(long, env = "MULTIROM_DIR")]
    multirom_dir: Option<PathBuf>,

    /// Roms location: "Internal memory" or "<device> (<fstype>)"
    #[arg(long, default_value = "Internal memory")]
    location: InstallLocation,

    /// Override the configured kernel policy
    #[arg(long, value_enum)]
    kernel_policy: Option<PolicyArg>,

    /// Turn on the share_kernel setting
    #[arg(long)]
    share_kernel: bool,

    /// Log every mount and command instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    AlwaysInject,
    InjectUnlessShared,
    ShareHostKernel,
}

impl From<PolicyArg> for KernelPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::AlwaysInject => KernelPolicy::AlwaysInject,
            PolicyArg::InjectUnlessShared => KernelPolicy::InjectUnlessShared,
            PolicyArg::ShareHostKernel => KernelPolicy::ShareHostKernel,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    Android,
    Foreign,
    Installer,
}

#[derive(Subcommand)]
enum Command {
    /// List installed ROMs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Install a new ROM
    Add {
        /// Flashable zip, installer zip or root filesystem image
        source: PathBuf,

        /// Source type, guessed from the file when omitted
        #[arg(long, value_enum)]
        kind: Option<SourceKind>,

        /// ROM name, derived from the source when omitted
        #[arg(long)]
        name: Option<String>,

        /// Kernel boot image for a foreign OS ROM
        #[arg(long)]
        boot_image: Option<PathBuf>,
    },

    /// Rename a ROM
    Rename { from: String, to: String },

    /// Erase a ROM
    Erase { name: String },

    /// Wipe dalvik, system, data or cache of a ROM
    Wipe { name: String, what: WipeTarget },

    /// Flash a zip into an installed ROM
    Flash { name: String, package: PathBuf },

    /// Inject the trampoline into a boot image or the boot partition
    InjectBoot { image: PathBuf },

    /// Re-patch the init of a foreign OS ROM
    PatchInit { name: String },

    /// Keep a foreign OS ROM from flashing its own kernel
    DisableFlashKernel { name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(policy) = cli.kernel_policy {
        config.kernel_policy = policy.into();
    }

    let mut session = open_session(&cli, config)?;

    match cli.command {
        Command::List { json } => {
            session.set_location(&cli.location)?;
            cmd_list(&session, json)?;
        }

        Command::Add {
            source,
            kind,
            name,
            boot_image,
        } => {
            let source = rom_source(&source, kind, boot_image)?;
            let mut request = AddRequest::new(source).location(cli.location.clone());
            if let Some(name) = name {
                request = request.name(name);
            }
            let name = session.add_rom(&request).context("ROM installation failed")?;
            println!("Installed ROM {}", name);
        }

        Command::Rename { from, to } => {
            session.set_location(&cli.location)?;
            session.rename_rom(&from, &to)?;
        }

        Command::Erase { name } => {
            session.set_location(&cli.location)?;
            session.erase_rom(&name)?;
        }

        Command::Wipe { name, what } => {
            session.set_location(&cli.location)?;
            session
                .wipe_rom(&name, what)
                .with_context(|| format!("failed to wipe {} of {}", what, name))?;
        }

        Command::Flash { name, package } => {
            session.set_location(&cli.location)?;
            session
                .flash_package(&name, &package)
                .with_context(|| format!("failed to flash {}", package.display()))?;
        }

        Command::InjectBoot { image } => {
            session.inject_boot(&image)?;
            println!("Trampoline injected into {}", image.display());
        }

        Command::PatchInit { name } => {
            session.set_location(&cli.location)?;
            session.patch_init(&name)?;
        }

        Command::DisableFlashKernel { name } => {
            session.set_location(&cli.location)?;
            session.disable_flash_kernel(&name)?;
        }
    }

    Ok(())
}

fn open_session(cli: &Cli, config: EngineConfig) -> Result<MultiRom> {
    let host: Box<dyn Host> = if cli.dry_run {
        tracing::info!("Dry run, nothing is mounted or executed");
        Box::new(RecordingHost::new())
    } else {
        Box::new(SystemHost::new())
    };

    let mut settings = MemorySettings::new();
    if cli.share_kernel {
        settings.set(SHARE_KERNEL_SETTING, SettingValue::Bool(true));
    }

    let staging = config
        .scratch
        .package_copy
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let installer = Box::new(UpdateBinaryInstaller::new(staging));

    let session = match &cli.multirom_dir {
        Some(dir) => MultiRom::new(config, dir, host, Box::new(settings), installer),
        None => MultiRom::discover(config, host, Box::new(settings), installer)
            .context("MultiROM folder not found")?,
    };
    Ok(session)
}

/// Work out what a source file installs
fn rom_source(
    path: &Path,
    kind: Option<SourceKind>,
    boot_image: Option<PathBuf>,
) -> Result<RomSource> {
    let kind = match kind {
        Some(kind) => kind,
        None => guess_kind(path)?,
    };

    if boot_image.is_some() && !matches!(kind, SourceKind::Foreign) {
        bail!("--boot-image only applies to foreign OS images");
    }

    Ok(match kind {
        SourceKind::Android => RomSource::Package(path.to_path_buf()),
        SourceKind::Installer => RomSource::Installer(path.to_path_buf()),
        SourceKind::Foreign => RomSource::ForeignImage {
            image: path.to_path_buf(),
            boot_image,
        },
    })
}

fn guess_kind(path: &Path) -> Result<SourceKind> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".img") || name.ends_with(".img.gz") {
        return Ok(SourceKind::Foreign);
    }
    if name.ends_with(".zip") {
        let package = Package::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        return Ok(if package.has_entry(MANIFEST_NAME) {
            SourceKind::Installer
        } else {
            SourceKind::Android
        });
    }
    bail!("cannot tell what {} is, pass --kind", path.display())
}

fn cmd_list(session: &MultiRom, json: bool) -> Result<()> {
    let roms = session.list_roms()?;

    if json {
        let list: Vec<_> = roms
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "os": r.os_kind(),
                    "location": r.location(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    println!("=== ROMs in {} ===", session.roms_root().path.display());
    if roms.is_empty() {
        println!("No ROMs installed.");
        return Ok(());
    }
    for rom in &roms {
        println!("{}", rom);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let cli = Cli::try_parse_from([
            "multirom",
            "--location",
            "/dev/block/sda1 (ext4)",
            "add",
            "rootfs.img",
            "--boot-image",
            "boot.img",
        ])
        .unwrap();
        assert!(matches!(cli.location, InstallLocation::External { .. }));
        assert!(matches!(cli.command, Command::Add { .. }));
    }

    #[test]
    fn test_guess_kind_by_extension() {
        assert!(matches!(
            guess_kind(Path::new("/sdcard/ubuntu.img.gz")).unwrap(),
            SourceKind::Foreign
        ));
        assert!(guess_kind(Path::new("/sdcard/notes.txt")).is_err());

        let boot = Some(PathBuf::from("boot.img"));
        assert!(rom_source(Path::new("rom.zip"), Some(SourceKind::Android), boot).is_err());
    }
}
