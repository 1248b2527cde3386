//! Collaborator traits

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::host::Host;

/// Installs a flashable package into whatever is currently mounted
pub trait PackageInstaller {
    /// Human-readable identifier for this installer
    fn identify(&self) -> &str;

    /// Run the package and return its status code (0 on success)
    fn install(&mut self, host: &mut dyn Host, package: &Path) -> Result<i32>;
}

/// A typed setting value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            SettingValue::Int(i) => write!(f, "{}", i),
            SettingValue::Str(s) => f.write_str(s),
        }
    }
}

/// Process-wide settings with typed access
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<SettingValue>;

    fn set(&mut self, key: &str, value: SettingValue);

    /// Booleans may also be stored as 0/1 integers or strings
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SettingValue::Bool(b) => Some(b),
            SettingValue::Int(i) => Some(i != 0),
            SettingValue::Str(s) => match s.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            SettingValue::Int(i) => Some(i),
            SettingValue::Bool(b) => Some(b as i64),
            SettingValue::Str(s) => s.trim().parse().ok(),
        }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string())
    }
}

/// In-memory settings store
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: HashMap<String, SettingValue>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: SettingValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<SettingValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: SettingValue) {
        self.values.insert(key.to_string(), value);
    }
}
