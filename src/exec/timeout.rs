//! Timeout-and-kill for external commands
//!
//! `TimeoutWait` runs one command, counts down in whole seconds and, when the
//! count reaches zero, interrupts the command and escalates to `SIGKILL` if it
//! is still around after a grace period. Identical command lines are
//! serialized through [`CommandLock`].
//!
//! Each command runs in its own process group and signals go to the whole
//! group, so wrappers (`sh -c`, `service`, `jexec`) do not leave their
//! children behind.

use super::lock::{CommandLock, LockError};
use super::shutdown::Shutdown;
use crate::escape::shell_join;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info, warn};

/// Length of one countdown step
const TICK: Duration = Duration::from_secs(1);

/// Default wait between SIGINT and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("no command given")]
    EmptyCommand,

    #[error("'{command}' is already running (lock {lock_path:?})")]
    AlreadyRunning { command: String, lock_path: PathBuf },

    #[error(transparent)]
    Lock(LockError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("interrupted while waiting for '{command}'")]
    Interrupted { command: String },
}

/// How a guarded command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Exited on its own with this status code
    Exited(i32),

    /// Terminated by a signal it did not get from us
    Signaled(i32),

    /// The countdown expired and the command was killed. `escalated` is set
    /// when SIGINT was not enough and SIGKILL had to be sent.
    TimedOut { escalated: bool },
}

impl WaitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, WaitOutcome::Exited(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => WaitOutcome::Exited(code),
            None => WaitOutcome::Signaled(status.signal().unwrap_or(0)),
        }
    }
}

impl std::fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitOutcome::Exited(code) => write!(f, "exited with status {}", code),
            WaitOutcome::Signaled(sig) => write!(f, "killed by signal {}", sig),
            WaitOutcome::TimedOut { escalated: false } => write!(f, "timed out (interrupted)"),
            WaitOutcome::TimedOut { escalated: true } => write!(f, "timed out (killed)"),
        }
    }
}

/// Timeout guard for external commands
#[derive(Debug, Clone)]
pub struct TimeoutWait {
    lock_dir: PathBuf,
    kill_grace: Duration,
    working_dir: Option<PathBuf>,
    shutdown: Shutdown,
}

impl TimeoutWait {
    /// Create a guard that keeps its lock files in `lock_dir`
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir: None,
            shutdown: Shutdown::new(),
        }
    }

    /// Set the wait between SIGINT and SIGKILL
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Run commands from this directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Stop commands when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Run `argv` for at most `timeout_secs` seconds
    ///
    /// When the guard's [`Shutdown`] fires, the command is stopped and
    /// [`TimeoutError::Interrupted`] is returned. Nothing is started once it
    /// has fired.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use nas_rc::exec::TimeoutWait;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let guard = TimeoutWait::new("/var/run/nasrc");
    ///     let argv = vec!["sleep".to_string(), "2".to_string()];
    ///     let outcome = guard.run(&argv, 5).await?;
    ///     assert!(outcome.success());
    ///     Ok(())
    /// }
    /// ```
    pub async fn run(&self, argv: &[String], timeout_secs: u64) -> Result<WaitOutcome, TimeoutError> {
        if self.shutdown.is_triggered() {
            return Err(TimeoutError::Interrupted {
                command: shell_join(argv),
            });
        }
        self.run_until(argv, timeout_secs, self.shutdown.wait()).await
    }

    /// Like [`run`](Self::run), with a caller-supplied interrupt future
    pub async fn run_until<F>(
        &self,
        argv: &[String],
        timeout_secs: u64,
        interrupt: F,
    ) -> Result<WaitOutcome, TimeoutError>
    where
        F: Future<Output = ()>,
    {
        let (program, args) = argv.split_first().ok_or(TimeoutError::EmptyCommand)?;
        let command_line = shell_join(argv);

        // Held until this function returns on any path
        let _lock = CommandLock::acquire(&self.lock_dir, &command_line).map_err(|e| match e {
            LockError::Busy(lock_path) => TimeoutError::AlreadyRunning {
                command: command_line.clone(),
                lock_path,
            },
            other => TimeoutError::Lock(other),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args).process_group(0).kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| TimeoutError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("Started '{}' (pid {:?}), timeout {}s", command_line, child.id(), timeout_secs);

        let wait_err = |source| TimeoutError::Wait {
            command: command_line.clone(),
            source,
        };

        tokio::pin!(interrupt);
        let mut remaining = timeout_secs;
        loop {
            if let Some(status) = child.try_wait().map_err(wait_err)? {
                return Ok(WaitOutcome::from_status(status));
            }
            if remaining == 0 {
                break;
            }
            tokio::select! {
                status = child.wait() => {
                    return Ok(WaitOutcome::from_status(status.map_err(wait_err)?));
                }
                _ = time::sleep(TICK) => {
                    remaining -= 1;
                }
                _ = &mut interrupt => {
                    warn!("Interrupted, stopping '{}'", command_line);
                    kill_process(&mut child, self.kill_grace).await?;
                    return Err(TimeoutError::Interrupted { command: command_line.clone() });
                }
            }
        }

        warn!("'{}' timed out after {}s", command_line, timeout_secs);
        let escalated = kill_process(&mut child, self.kill_grace).await?;
        Ok(WaitOutcome::TimedOut { escalated })
    }
}

/// Stop a child that leads its own process group
///
/// The group gets SIGINT first and SIGKILL if the child is still there after
/// `grace`. Group members that outlive the child are killed as well. Returns
/// whether SIGKILL was needed for the child. The child is always reaped.
pub async fn kill_process(child: &mut Child, grace: Duration) -> Result<bool, TimeoutError> {
    let Some(raw_pid) = child.id() else {
        // Already reaped
        return Ok(false);
    };
    let pgid = Pid::from_raw(raw_pid as i32);
    let reap_err = |source| TimeoutError::Wait {
        command: format!("pid {}", raw_pid),
        source,
    };

    signal_group(pgid, Signal::SIGINT)?;
    if let Ok(status) = time::timeout(grace, child.wait()).await {
        status.map_err(reap_err)?;
        info!("pid {} exited after SIGINT", raw_pid);
        kill_stragglers(pgid)?;
        return Ok(false);
    }

    if !group_exists(pgid) {
        child.wait().await.map_err(reap_err)?;
        return Ok(false);
    }

    warn!("pid {} ignored SIGINT, sending SIGKILL", raw_pid);
    signal_group(pgid, Signal::SIGKILL)?;
    child.wait().await.map_err(reap_err)?;
    Ok(true)
}

fn kill_stragglers(pgid: Pid) -> Result<(), TimeoutError> {
    if group_exists(pgid) {
        debug!("Process group {} outlived its leader, sending SIGKILL", pgid);
        signal_group(pgid, Signal::SIGKILL)?;
    }
    Ok(())
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), TimeoutError> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(TimeoutError::Signal {
            pid: pgid.as_raw(),
            source,
        }),
    }
}

fn group_exists(pgid: Pid) -> bool {
    killpg(pgid, None).is_ok()
}
