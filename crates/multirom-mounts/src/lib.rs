//! # MultiROM Mounts
//!
//! Mount transactions: while one is open, `/system`, `/data` and `/cache`
//! point at a ROM's storage instead of the host's partitions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_core::{EngineConfig, RecordingHost, RomLocation};
//! use multirom_mounts::MountManager;
//! use std::path::Path;
//!
//! let mut host = RecordingHost::new();
//! let mut mounts = MountManager::new(EngineConfig::default());
//! let txn = mounts
//!     .open(&mut host, Path::new("/data/media/0/multirom/roms/MyROM"), RomLocation::Internal)
//!     .unwrap();
//! println!("redirected to {}", txn.rom_base().display());
//! txn.close();
//! ```

pub mod alias;
pub mod backup;
pub mod fstab;
pub mod transaction;

pub use alias::PathAlias;
pub use backup::MountBackup;
pub use fstab::{render_fstab, render_recovery_fstab, REDIRECTED_VOLUMES};
pub use transaction::{MountManager, MountTransaction};
