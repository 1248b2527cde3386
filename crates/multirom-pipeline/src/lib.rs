//! # MultiROM Pipeline
//!
//! Boot image ramdisk patching.
//!
//! - **CompressionKind / RamdiskCodec**: gzip, legacy LZ4 and (decode only) LZMA
//! - **cpio**: newc archive reader and writer
//! - **BootPatcher**: unpack, inject the trampoline as `init`, repack, write back
//! - **export_boot**: loose boot files for a secondary Android ROM
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_core::SystemHost;
//! use multirom_pipeline::BootPatcher;
//! use std::path::Path;
//!
//! let mut host = SystemHost::new();
//! let patcher = BootPatcher::new("/tmp/boot", "/data/media/0/multirom/trampoline");
//! patcher.patch(&mut host, Path::new("/sdcard/boot.img")).unwrap();
//! ```

pub mod bootimg;
pub mod compression;
pub mod cpio;
pub mod export;
pub mod lz4_legacy;
pub mod patcher;
pub mod scratch;
pub mod trampoline;
pub mod verify;

pub use bootimg::{repack, unpack, BootArtifacts};
pub use compression::{CompressionKind, RamdiskCodec};
pub use cpio::{CpioData, CpioEntry};
pub use export::{export_boot, BOOT_DIR, BOOT_IMAGE};
pub use patcher::BootPatcher;
pub use scratch::ScratchDir;
pub use trampoline::{inject_trampoline, MAIN_INIT};
pub use verify::{sha256_file, write_image};
