//! # MultiROM Layout
//!
//! On-disk organisation of installed ROMs:
//! - **classify**: infer a ROM's kind from marker files
//! - **naming**: pick a unique name for a new ROM
//! - **storage**: create directory and image volumes
//! - **location**: resolve the internal or external roms root
//!
//! ## Example
//!
//! ```rust,no_run
//! use multirom_layout::{classify, RootContext};
//! use std::path::Path;
//!
//! match classify(Path::new("/data/media/0/multirom/roms/MyROM"), RootContext::Internal) {
//!     Some(kind) => println!("{}", kind),
//!     None => println!("unknown"),
//! }
//! ```

pub mod classify;
pub mod location;
pub mod naming;
pub mod storage;

pub use classify::{classify, describe, RootContext};
pub use location::{InstallLocation, RomsRoot, INTERNAL_LOCATION_LABEL};
pub use naming::{candidate_name, dedupe_name, existing_names, resolve_name};
pub use storage::{create_image, create_layout, plan_layout};
