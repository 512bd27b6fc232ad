//! Command Runner
//!
//! Every external tool (warden, jexec, mdconfig, mount, ...) is invoked
//! through [`CommandRunner`]. The system implementation captures output and
//! enforces a per-call timeout; long-running guarded commands go through
//! [`TimeoutWait`] instead.

use super::timeout::{TimeoutError, TimeoutWait, WaitOutcome};
use crate::escape::shell_join;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

/// Default timeout for tool execution in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Maximum captured output size in bytes (1MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Captured result of one tool invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,

    /// Standard output (truncated if too large)
    pub stdout: String,

    /// Standard error (truncated if too large)
    pub stderr: String,

    /// Exit code (None if the process was terminated)
    pub exit_code: Option<i32>,

    /// Execution duration in milliseconds
    pub duration_ms: f64,

    /// Whether execution timed out
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }

    pub fn timeout(duration_ms: f64) -> Self {
        Self {
            success: false,
            duration_ms,
            timed_out: true,
            ..Default::default()
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.timed_out {
            format!("Timeout after {:.0}ms", self.duration_ms)
        } else if self.success {
            format!(
                "Success (exit code: {:?}, {:.0}ms, {} bytes output)",
                self.exit_code,
                self.duration_ms,
                self.stdout.len()
            )
        } else {
            format!(
                "Failed (exit code: {:?}, {:.0}ms): {}",
                self.exit_code,
                self.duration_ms,
                self.stderr.trim()
            )
        }
    }

    /// Turn an unsuccessful result into an error naming `what`
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            anyhow::bail!("{}: {}", what, self.summary())
        }
    }
}

/// Seam between the orchestration logic and the external tools it drives
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a tool to completion and capture its output
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run a command under the timeout-and-kill guard with inherited stdio
    async fn run_guarded(&self, argv: &[String], timeout_secs: u64)
        -> Result<WaitOutcome, TimeoutError>;
}

/// Configuration for the system runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Timeout for a captured tool call
    pub timeout: Duration,

    /// Maximum output size in bytes
    pub max_output_size: usize,

    /// Working directory for command execution (default: current directory)
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_size: MAX_OUTPUT_SIZE,
            working_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Create a runner config with custom timeout
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        }
    }
}

/// Runs tools as real child processes
#[derive(Debug, Clone)]
pub struct SystemRunner {
    config: RunnerConfig,
    guard: TimeoutWait,
}

impl SystemRunner {
    pub fn new(config: RunnerConfig, guard: TimeoutWait) -> Self {
        Self { config, guard }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let start = std::time::Instant::now();
        let cmd_str = format!("{} {}", program, shell_join(args));
        debug!("Executing: {}", cmd_str.trim_end());

        let mut process = TokioCommand::new(program);
        process.args(args);
        if let Some(ref dir) = self.config.working_dir {
            process.current_dir(dir);
        }
        process.stdin(std::process::Stdio::null());
        process.stdout(std::process::Stdio::piped());
        process.stderr(std::process::Stdio::piped());
        // Dropping the wait future on timeout kills the child
        process.kill_on_drop(true);

        let child = process
            .spawn()
            .with_context(|| format!("Failed to spawn process: {}", program))?;

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(result) => result.with_context(|| format!("Failed to wait for {}", program))?,
            Err(_) => {
                warn!("Command timed out after {:?}: {}", self.config.timeout, cmd_str);
                return Ok(CommandOutput::timeout(start.elapsed().as_millis() as f64));
            }
        };

        let duration_ms = start.elapsed().as_millis() as f64;
        let stdout = truncate_string(
            String::from_utf8_lossy(&output.stdout).to_string(),
            self.config.max_output_size,
        );
        let stderr = truncate_string(
            String::from_utf8_lossy(&output.stderr).to_string(),
            self.config.max_output_size,
        );
        let exit_code = output.status.code();

        if output.status.success() {
            debug!("Command succeeded: {}", cmd_str.trim_end());
        } else {
            debug!("Command failed: {} (exit code: {:?})", cmd_str.trim_end(), exit_code);
        }

        Ok(CommandOutput {
            success: output.status.success(),
            stdout,
            stderr,
            exit_code,
            duration_ms,
            timed_out: false,
        })
    }

    async fn run_guarded(
        &self,
        argv: &[String],
        timeout_secs: u64,
    ) -> Result<WaitOutcome, TimeoutError> {
        self.guard.run(argv, timeout_secs).await
    }
}

/// Truncate a string to a maximum length, adding ellipsis if truncated
fn truncate_string(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len.saturating_sub(3);
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}
