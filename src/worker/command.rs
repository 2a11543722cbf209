//! Local command execution
//!
//! Every filesystem operation a worker performs on a work item goes through a
//! [`CommandRunner`], so the executor can be driven by a scripted runner in
//! tests and by [`ProcessRunner`] in production.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Exit code recorded when the runner itself fails rather than the command
pub const SENTINEL_EXIT_CODE: i32 = 5555;

/// One command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Path that must exist after a successful run
    pub expect_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            expect_path: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn expect(mut self, path: &Path) -> Self {
        self.expect_path = Some(path.to_path_buf());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of one command attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Command line as text
    pub command: String,
    /// Process exit code, or [`SENTINEL_EXIT_CODE`]
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error, or the runner error message
    pub stderr: String,
}

impl CommandOutcome {
    /// Outcome for an attempt where the runner failed before the command finished
    pub fn sentinel(spec: &CommandSpec, err: &io::Error) -> Self {
        Self {
            command: spec.to_string(),
            exit_code: SENTINEL_EXIT_CODE,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands and inspects the local filesystem
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutcome>;

    /// Whether a path exists
    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Size of a file, `None` if it cannot be read
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutcome> {
        let output = Command::new(&spec.program)
            .args(&spec.args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("'{}' timed out after {:?}", spec, self.timeout)))??;

        Ok(CommandOutcome {
            command: spec.to_string(),
            // Killed by signal: no code
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
