//! Generic installer manifest (`manifest.txt`)
//!
//! A flat list of `key="value"` lines. `#` starts a comment line.

use std::collections::BTreeMap;

use multirom_core::{BaseFolder, Error, Result, RomLocation};

/// Manifest file name at the package root
pub const MANIFEST_NAME: &str = "manifest.txt";

/// Highest manifest format this engine understands
pub const MANIFEST_VERSION: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    values: BTreeMap<String, String>,
}

fn location_key(location: RomLocation) -> &'static str {
    match location {
        RomLocation::Internal => "internal",
        RomLocation::ExternalDirectory => "dir",
        RomLocation::ExternalImage => "img",
    }
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::invalid_manifest(format!("line {}: expected key=\"value\"", idx + 1))
            })?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            values.insert(key.trim().to_string(), value.to_string());
        }

        let manifest = Self { values };
        let version = manifest.get_int("manifest_ver", 0)?;
        if version > MANIFEST_VERSION {
            return Err(Error::invalid_manifest(format!(
                "manifest version {} is newer than supported {}",
                version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| Error::invalid_manifest(format!("{} is not a number: {}", key, v))),
        }
    }

    pub fn rom_name(&self) -> Option<&str> {
        self.get("rom_name")
    }

    /// Text shown before installing, with `\n` escapes expanded
    pub fn install_text(&self) -> Option<String> {
        self.get("install_text").map(|t| t.replace("\\n", "\n"))
    }

    pub fn root_dir(&self) -> Option<&str> {
        self.get("root_dir")
    }

    pub fn pre_install(&self) -> Option<&str> {
        self.get("pre_install")
    }

    pub fn post_install(&self) -> Option<&str> {
        self.get("post_install")
    }

    /// Whether the package may be installed to `location`
    pub fn allows(&self, location: RomLocation) -> bool {
        match self.get("install_loc") {
            None => true,
            Some(locs) => locs
                .split_whitespace()
                .any(|l| l == "all" || l == location_key(location)),
        }
    }

    pub fn check_location(&self, location: RomLocation) -> Result<()> {
        if self.allows(location) {
            return Ok(());
        }
        let msg = format!(
            "cannot be installed to {:?} (install_loc=\"{}\")",
            location,
            self.get("install_loc").unwrap_or_default()
        );
        tracing::error!("This ROM {}", msg);
        Err(Error::invalid_manifest(msg))
    }

    /// Declared base folders, `name:min_mb:default_mb` separated by spaces
    pub fn base_folders(&self) -> Result<Vec<BaseFolder>> {
        let Some(list) = self.get("base_folders") else {
            return Ok(Vec::new());
        };

        let mut folders: Vec<BaseFolder> = Vec::new();
        for item in list.split_whitespace() {
            let parts: Vec<&str> = item.split(':').collect();
            let [name, min, size] = parts[..] else {
                return Err(Error::invalid_manifest(format!(
                    "base folder '{}' is not name:min:default",
                    item
                )));
            };
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                return Err(Error::invalid_manifest(format!("bad base folder name '{}'", name)));
            }
            if folders.iter().any(|f| f.name == name) {
                return Err(Error::invalid_manifest(format!("duplicate base folder '{}'", name)));
            }

            let parse = |v: &str| {
                v.parse::<i64>().map_err(|_| {
                    Error::invalid_manifest(format!("base folder '{}': bad size '{}'", name, v))
                })
            };
            let min = parse(min)?;
            let size = parse(size)?;
            if min <= 0 || size < min {
                return Err(Error::invalid_manifest(format!(
                    "base folder '{}': sizes {}..{} are invalid",
                    name, min, size
                )));
            }
            folders.push(BaseFolder::new(name, min, size));
        }
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Ubuntu Touch installer
manifest_ver="1"
rom_name="Ubuntu Touch"
install_text="Installing Ubuntu Touch\nThis takes a while"
install_loc="internal dir"
base_folders="system:400:640 data:128:1024"
root_dir="root"
pre_install="pre_install"
post_install="post_install"
"#;

    #[test]
    fn test_parse() {
        let m = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(m.rom_name(), Some("Ubuntu Touch"));
        assert_eq!(
            m.install_text().unwrap(),
            "Installing Ubuntu Touch\nThis takes a while"
        );
        assert_eq!(m.root_dir(), Some("root"));
        assert_eq!(m.get("missing"), None);

        let folders = m.base_folders().unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[1].name, "data");
        assert_eq!(folders[1].min_size_mb, 128);
        assert_eq!(folders[1].size_mb, 1024);
    }

    #[test]
    fn test_install_locations() {
        let m = Manifest::parse(SAMPLE).unwrap();
        assert!(m.allows(RomLocation::Internal));
        assert!(m.allows(RomLocation::ExternalDirectory));
        assert!(matches!(
            m.check_location(RomLocation::ExternalImage),
            Err(Error::InvalidManifest(_))
        ));

        let all = Manifest::parse("install_loc=\"all\"").unwrap();
        assert!(all.allows(RomLocation::ExternalImage));
        assert!(Manifest::default().allows(RomLocation::ExternalImage));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Manifest::parse("just text").is_err());
        assert!(Manifest::parse("manifest_ver=\"9\"").is_err());

        let m = Manifest::parse("base_folders=\"system:400\"").unwrap();
        assert!(m.base_folders().is_err());
        let m = Manifest::parse("base_folders=\"system:400:100\"").unwrap();
        assert!(m.base_folders().is_err());
        let m = Manifest::parse("base_folders=\"../x:1:1\"").unwrap();
        assert!(m.base_folders().is_err());
    }
}
