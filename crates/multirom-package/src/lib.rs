//! # MultiROM Package
//!
//! Everything that reads flashable packages.
//!
//! - **Package**: zip entry lookup and extraction
//! - **ScriptSanitizer**: drops updater-script lines that would touch mounts,
//!   partitions or the boot sector
//! - **prepare_package**: copy and sanitize a package before flashing
//! - **InstallerPackage**: manifest-driven generic installers
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_package::ScriptSanitizer;
//!
//! let sanitizer = ScriptSanitizer::default();
//! let out = sanitizer.sanitize("mount(\"/system\");\nui_print(\"hi\");\n");
//! assert_eq!(out.script, "ui_print(\"hi\");\n");
//! ```

pub mod archive;
pub mod generic;
pub mod installer;
pub mod manifest;
pub mod prepare;
pub mod sanitize;
pub mod tarball;

pub use archive::Package;
pub use generic::{HookStage, InstallerPackage};
pub use installer::{UpdateBinaryInstaller, UPDATE_BINARY};
pub use manifest::{Manifest, MANIFEST_NAME};
pub use prepare::{prepare_package, replace_entry, PreparedPackage, UPDATER_SCRIPT};
pub use sanitize::{Sanitized, ScriptSanitizer};
pub use tarball::{unpack_tar_gz, unpack_tar_gz_file};
