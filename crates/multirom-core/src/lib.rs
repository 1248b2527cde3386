//! # MultiROM Core
//!
//! Core types, error handling and system seams shared by the MultiROM crates.
//!
//! - **RomKind**: OS kind paired with its storage location
//! - **StorageRoot**: a ROM's base path and its volumes
//! - **EngineConfig**: device constants, scratch paths and policies
//! - **Host**: every mount, unmount and external tool goes through it
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_core::{Cmd, Host, RecordingHost, Result};
//!
//! fn probe(host: &mut dyn Host) -> Result<()> {
//!     let out = host.run(&Cmd::new("busybox").arg("--help").allow_fail())?;
//!     println!("exit code {}", out.code);
//!     Ok(())
//! }
//!
//! probe(&mut RecordingHost::new()).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod process;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use config::{EngineConfig, KernelDecision, KernelPolicy, SHARE_KERNEL_SETTING};
pub use error::{Error, Result};
pub use host::{Host, HostEvent, MountRequest, RecordingHost, SystemHost};
pub use process::{Cmd, CommandResult};
pub use security::*;
pub use traits::{MemorySettings, PackageInstaller, SettingValue, SettingsStore};
pub use types::{
    BaseFolder, OsKind, RomDescriptor, RomKind, RomLocation, StorageRoot, Substrate, Volume,
    VolumeBacking, INTERNAL_ROM_NAME,
};
