//! # MultiROM Install
//!
//! The session object tying classification, mount transactions, the boot
//! patch pipeline and package handling into the user-facing operations.
//!
//! - **MultiRom::add_rom**: install a new Android, foreign OS or generic ROM
//! - **MultiRom::flash_package**: flash a zip into an installed ROM
//! - **MultiRom::list_roms / rename_rom / erase_rom / wipe_rom**
//! - **MultiRom::patch_init / disable_flash_kernel**: foreign OS maintenance
//! - **MultiRom::inject_boot**: patch any boot image with the trampoline
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_core::{EngineConfig, MemorySettings, SystemHost};
//! use multirom_install::{AddRequest, MultiRom, RomSource};
//! use multirom_package::UpdateBinaryInstaller;
//!
//! let config = EngineConfig::default();
//! let installer = UpdateBinaryInstaller::new("/tmp");
//! let mut session = MultiRom::discover(
//!     config,
//!     Box::new(SystemHost::new()),
//!     Box::new(MemorySettings::new()),
//!     Box::new(installer),
//! )
//! .unwrap();
//!
//! let name = session
//!     .add_rom(&AddRequest::new(RomSource::Package("/sdcard/cm-10.1.zip".into())))
//!     .unwrap();
//! println!("installed {}", name);
//! ```

pub mod add;
mod android;
mod foreign;
mod generic;
pub mod session;

pub use add::{AddRequest, RomSource};
pub use session::{remap_package_path, MultiRom, WipeTarget, TRAMPOLINE_NAME};
