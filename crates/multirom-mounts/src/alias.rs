//! Temporary rename of ROM paths the mount table syntax can't express

use std::fs;
use std::path::{Path, PathBuf};

use multirom_core::Result;

/// A ROM directory renamed for the duration of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAlias {
    pub original: PathBuf,
    pub alias: PathBuf,
}

/// Alias for `path`: spaces become `-`, then `a` is appended until unused
///
/// Returns `None` when the path needs no alias.
pub fn alias_for(path: &Path) -> Option<PathBuf> {
    let text = path.to_string_lossy();
    if !text.contains(' ') {
        return None;
    }

    let mut alias = text.replace(' ', "-");
    while Path::new(&alias).exists() {
        alias.push('a');
    }
    Some(PathBuf::from(alias))
}

impl PathAlias {
    /// The alias `path` would be renamed to, if it needs one
    pub fn plan(path: &Path) -> Option<Self> {
        alias_for(path).map(|alias| Self {
            original: path.to_path_buf(),
            alias,
        })
    }

    /// Rename the original to the alias
    pub fn apply(&self) -> Result<()> {
        fs::rename(&self.original, &self.alias)?;
        tracing::debug!(
            "Renamed {} to {}",
            self.original.display(),
            self.alias.display()
        );
        Ok(())
    }

    /// Rename the alias back to the original name
    pub fn revert(&self) -> Result<()> {
        fs::rename(&self.alias, &self.original)?;
        Ok(())
    }
}
