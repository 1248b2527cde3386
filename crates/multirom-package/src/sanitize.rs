//! Updater-script sanitizer
//!
//! A package flashed into a secondary ROM must not mount, format or write the
//! boot partition: the mounts are already redirected and the boot sector
//! belongs to the host. Offending lines are dropped, everything else passes
//! through in order.

use multirom_core::EngineConfig;

/// Line filter for updater-scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSanitizer {
    block_namespace: String,
    boot_nodes: Vec<String>,
}

/// Output of [`ScriptSanitizer::sanitize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub script: String,
    pub dropped: usize,
}

impl Sanitized {
    pub fn changed(&self) -> bool {
        self.dropped > 0
    }
}

impl ScriptSanitizer {
    pub fn new(block_namespace: impl Into<String>, boot_nodes: Vec<String>) -> Self {
        Self {
            block_namespace: block_namespace.into(),
            boot_nodes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.block_namespace.clone(),
            vec![
                config.legacy_boot_node.clone(),
                config.boot_partition.to_string_lossy().into_owned(),
            ],
        )
    }

    /// Whether a line must not run under a redirected mount
    pub fn skip_line(&self, line: &str) -> bool {
        // bind mounts through the busybox helper are the only mounts allowed
        if line.contains("mount") && (!line.contains("bin/mount") || line.contains("run_program"))
        {
            return true;
        }

        if line.contains("format") {
            return true;
        }

        if !self.block_namespace.is_empty() && line.contains(self.block_namespace.as_str()) {
            return true;
        }

        line.contains("boot.img")
            || self
                .boot_nodes
                .iter()
                .any(|n| !n.is_empty() && line.contains(n.as_str()))
    }

    /// Kept lines, in their original order
    pub fn filter<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        lines.into_iter().filter(|l| !self.skip_line(l)).collect()
    }

    /// Sanitize a whole script
    ///
    /// Empty lines are dropped without being counted and every kept line is
    /// newline-terminated.
    pub fn sanitize(&self, script: &str) -> Sanitized {
        let mut out = String::with_capacity(script.len());
        let mut dropped = 0;
        for line in script.split('\n').filter(|l| !l.is_empty()) {
            if self.skip_line(line) {
                tracing::debug!("Dropping script line: {}", line);
                dropped += 1;
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }
        Sanitized {
            script: out,
            dropped,
        }
    }
}

impl Default for ScriptSanitizer {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
