//! The seam between the engine and the live system
//!
//! All side effects outside the roms root go through a [`Host`]: running
//! tools, mounting and unmounting. [`SystemHost`] performs them for real,
//! [`RecordingHost`] only records them (dry runs and tests).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::process::{Cmd, CommandResult};

/// A single mount operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device, image or directory; `None` resolves through the mount table file
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
}

impl MountRequest {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            target: target.into(),
            fs_type: None,
            options: Vec::new(),
        }
    }

    /// Mount a target by looking it up in the system's mount table file
    pub fn from_table(target: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            target: target.into(),
            fs_type: None,
            options: Vec::new(),
        }
    }

    /// Bind a directory onto the target
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self::new(source, target).option("bind")
    }

    /// Loop-mount an image file onto the target
    pub fn loop_image(image: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self::new(image, target).option("loop")
    }

    pub fn fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    /// The `mount(8)` invocation equivalent to this request
    pub fn to_cmd(&self) -> Cmd {
        let mut cmd = Cmd::new("mount");
        if let Some(ref fs) = self.fs_type {
            cmd = cmd.args(["-t", fs]);
        }
        if !self.options.is_empty() {
            cmd = cmd.arg("-o").arg(self.options.join(","));
        }
        if let Some(ref source) = self.source {
            cmd = cmd.arg_path(source);
        }
        cmd.arg_path(&self.target)
    }
}

/// Side effects the engine needs from the live system
pub trait Host {
    /// Run an external tool, honoring the command's failure policy
    fn run(&mut self, cmd: &Cmd) -> Result<CommandResult>;

    fn mount(&mut self, request: &MountRequest) -> Result<()>;

    fn unmount(&mut self, target: &Path) -> Result<()>;

    fn is_mounted(&self, target: &Path) -> bool;

    /// Flush filesystem buffers
    fn sync(&mut self) {}
}

/// Host that executes everything for real
#[derive(Debug, Default)]
pub struct SystemHost {
    mounts_file: Option<PathBuf>,
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the mount table from somewhere other than `/proc/mounts`
    pub fn with_mounts_file(path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: Some(path.into()),
        }
    }
}

impl Host for SystemHost {
    fn run(&mut self, cmd: &Cmd) -> Result<CommandResult> {
        cmd.execute()
    }

    fn mount(&mut self, request: &MountRequest) -> Result<()> {
        request.to_cmd().execute().map(|_| ())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        Cmd::new("umount").arg_path(target).execute().map(|_| ())
    }

    fn is_mounted(&self, target: &Path) -> bool {
        let table = self
            .mounts_file
            .as_deref()
            .unwrap_or_else(|| Path::new("/proc/mounts"));
        match fs::read_to_string(table) {
            Ok(content) => mount_table_contains(&content, target),
            Err(_) => false,
        }
    }

    fn sync(&mut self) {
        if let Err(e) = Cmd::new("sync").execute() {
            tracing::warn!("sync failed: {}", e);
        }
    }
}

/// Check whether a `/proc/mounts`-style table lists the target as a mountpoint
pub fn mount_table_contains(table: &str, target: &Path) -> bool {
    let wanted = target.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        // /proc/mounts escapes spaces as \040
        .map(|point| point.replace("\\040", " "))
        .any(|point| point.trim_end_matches('/') == wanted)
}

/// Something the recording host observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Run(Cmd),
    Mount(MountRequest),
    Unmount(PathBuf),
    Sync,
}

/// Handler invoked instead of running a recorded program
pub type CommandHandler = Box<dyn FnMut(&Cmd) -> Result<CommandResult> + Send>;

/// Host that performs nothing and remembers everything
///
/// Mounts are tracked in memory so `is_mounted` answers consistently.
/// Programs can be scripted with [`RecordingHost::on`] or forced to fail
/// with [`RecordingHost::fail`].
#[derive(Default)]
pub struct RecordingHost {
    events: Vec<HostEvent>,
    mounted: Vec<PathBuf>,
    handlers: HashMap<String, CommandHandler>,
    failing_programs: HashSet<String>,
    failing_mounts: HashSet<PathBuf>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the effect of a program
    pub fn on<F>(&mut self, program: &str, handler: F) -> &mut Self
    where
        F: FnMut(&Cmd) -> Result<CommandResult> + Send + 'static,
    {
        self.handlers.insert(program.to_string(), Box::new(handler));
        self
    }

    /// Make every run of a program exit with status 1
    pub fn fail(&mut self, program: &str) -> &mut Self {
        self.failing_programs.insert(program.to_string());
        self
    }

    /// Make mounting onto the target fail
    pub fn fail_mount(&mut self, target: impl Into<PathBuf>) -> &mut Self {
        self.failing_mounts.insert(target.into());
        self
    }

    /// Pretend something is already mounted at the target
    pub fn assume_mounted(&mut self, target: impl Into<PathBuf>) -> &mut Self {
        self.mounted.push(target.into());
        self
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    /// Every command run, in order
    pub fn commands(&self) -> Vec<&Cmd> {
        self.events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Run(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Whether a program was run at least once
    pub fn ran(&self, program: &str) -> bool {
        self.commands().iter().any(|c| c.program() == program)
    }

    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }
}

impl Host for RecordingHost {
    fn run(&mut self, cmd: &Cmd) -> Result<CommandResult> {
        tracing::debug!("dry-run: {}", cmd);
        self.events.push(HostEvent::Run(cmd.clone()));

        if self.failing_programs.contains(cmd.program()) {
            return cmd.check(CommandResult::with_code(1));
        }
        let result = match self.handlers.get_mut(cmd.program()) {
            Some(handler) => handler(cmd)?,
            None => CommandResult::ok(),
        };
        cmd.check(result)
    }

    fn mount(&mut self, request: &MountRequest) -> Result<()> {
        tracing::debug!("dry-run: {}", request.to_cmd());
        self.events.push(HostEvent::Mount(request.clone()));

        if self.failing_mounts.contains(&request.target) {
            return Err(Error::tool_failed(
                "mount",
                255,
                format!("cannot mount {}", request.target.display()),
            ));
        }
        self.mounted.push(request.target.clone());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        tracing::debug!("dry-run: umount {}", target.display());
        self.events.push(HostEvent::Unmount(target.to_path_buf()));

        match self.mounted.iter().rposition(|m| m == target) {
            Some(idx) => {
                self.mounted.remove(idx);
                Ok(())
            }
            None => Err(Error::tool_failed(
                "umount",
                1,
                format!("{}: not mounted", target.display()),
            )),
        }
    }

    fn is_mounted(&self, target: &Path) -> bool {
        self.mounted.iter().any(|m| m == target)
    }

    fn sync(&mut self) {
        self.events.push(HostEvent::Sync);
    }
}
