//! External command description and execution
//!
//! Every tool the engine invokes (mount helpers, boot image packers, image
//! formatters, chroot commands) is described by a [`Cmd`]. A [`crate::Host`]
//! decides whether the command really runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use crate::error::{Error, Result};

/// Result of a command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// A successful result with no output
    pub fn ok() -> Self {
        Self::with_code(0)
    }

    pub fn with_code(code: i32) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    fn from_status(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// Builder describing one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    /// If true, a nonzero exit is returned instead of failing
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Allow non-zero exit codes without failing
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Map a finished run onto this command's failure policy
    pub fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if !self.allow_fail && !result.success() {
            return Err(Error::tool_failed(&self.program, result.code, result.stderr));
        }
        Ok(result)
    }

    /// Run the command for real and capture its output
    pub fn execute(&self) -> Result<CommandResult> {
        tracing::debug!("exec: {}", self);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|e| {
            Error::tool_failed(
                &self.program,
                -1,
                format!("failed to execute '{}': {}. Is it installed?", self.program, e),
            )
        })?;

        let result = CommandResult::from_status(output.status, &output.stdout, &output.stderr);
        self.check(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = Cmd::new("mount")
            .args(["-o", "loop"])
            .arg_path(Path::new("/mnt/my rom/root.img"));
        assert_eq!(cmd.to_string(), "mount -o loop \"/mnt/my rom/root.img\"");
    }

    #[test]
    fn test_execute_success() {
        let result = Cmd::new("true").execute().unwrap();
        assert!(result.success());
    }

    #[test]
    fn test_execute_failure() {
        let err = Cmd::new("false").execute().unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { code: 1, .. }));
    }

    #[test]
    fn test_allow_fail_returns_code() {
        let result = Cmd::new("false").allow_fail().execute().unwrap();
        assert_eq!(result.code, 1);
    }

    #[test]
    fn test_missing_program() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .execute()
            .unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { code: -1, .. }));
    }

    #[test]
    fn test_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").execute().unwrap();
        assert_eq!(result.stdout_trimmed(), "hello");
    }
}
