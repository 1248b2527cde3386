//! Mount table file rendering
//!
//! Both files list the redirected volumes in the order system, cache, data.
//! recovery.fstab is tab-delimited `mountpoint fstype device`; fstab uses
//! `device mountpoint fstype options`.

use std::fmt::Write;
use std::path::Path;

use multirom_core::Substrate;

/// Volumes redirected by a transaction, in file order
pub const REDIRECTED_VOLUMES: [&str; 3] = ["system", "cache", "data"];

const RECOVERY_HEADER: &str = "# mount point\tfstype\t\tdevice";

fn volume_source(base: &Path, volume: &str, substrate: Substrate) -> String {
    match substrate {
        Substrate::Directory => format!("{}/{}", base.display(), volume),
        Substrate::Image => format!("{}/{}.img", base.display(), volume),
    }
}

/// Render recovery.fstab pointing the root volumes at `base`
pub fn render_recovery_fstab(base: &Path, substrate: Substrate, tail: &[String]) -> String {
    let mut out = String::new();
    out.push_str(RECOVERY_HEADER);
    out.push('\n');

    for volume in REDIRECTED_VOLUMES {
        let _ = writeln!(
            out,
            "/{}\t\text4\t\t{}",
            volume,
            volume_source(base, volume, substrate)
        );
    }
    for line in tail {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Render fstab pointing the root volumes at `base`
pub fn render_fstab(base: &Path, substrate: Substrate, tail: &[String]) -> String {
    let options = match substrate {
        Substrate::Directory => "rw,bind",
        Substrate::Image => "loop 0 0",
    };

    let mut out = String::new();
    for volume in REDIRECTED_VOLUMES {
        let _ = writeln!(
            out,
            "{} /{} ext4 {}",
            volume_source(base, volume, substrate),
            volume,
            options
        );
    }
    for line in tail {
        out.push_str(line);
        out.push('\n');
    }
    out
}
