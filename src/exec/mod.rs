//! External Command Execution
//!
//! Everything nasrc does ends in an external tool. This module provides the
//! two ways those tools are run:
//!
//! - `runner.rs`: captured invocations behind the [`CommandRunner`] trait
//! - `timeout.rs`: the timeout-and-kill guard for long-running commands
//! - `lock.rs`: per-command-line advisory locks used by the guard
//! - `shutdown.rs`: the SIGINT/SIGTERM notice guarded waits stop on
//!
//! # Example
//!
//! ```no_run
//! use nas_rc::exec::{CommandRunner, RunnerConfig, SystemRunner, TimeoutWait};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = SystemRunner::new(RunnerConfig::default(), TimeoutWait::new("/var/run/nasrc"));
//!
//!     let output = runner.run("warden", &["list".to_string()]).await?;
//!     println!("{}", output.stdout);
//!
//!     let outcome = runner.run_guarded(&["sleep".to_string(), "1".to_string()], 5).await?;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

mod lock;
mod runner;
#[cfg(test)]
pub(crate) mod scripted;
mod shutdown;
mod timeout;

pub use lock::{CommandLock, LockError};
pub use runner::{CommandOutput, CommandRunner, RunnerConfig, SystemRunner};
pub use shutdown::Shutdown;
pub use timeout::{kill_process, TimeoutError, TimeoutWait, WaitOutcome, DEFAULT_KILL_GRACE};
