//! Per-command advisory locks
//!
//! Two `timeout_wait` calls with the same command line must not overlap. Each
//! command line maps to a lock file named after a hash of the line, and the
//! lock is taken with a non-blocking `flock(2)`.

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Attempts to win the lock before giving up on a path that keeps being replaced
const MAX_ACQUIRE_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {0:?} is held by another invocation")]
    Busy(PathBuf),

    #[error("lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock on one command line; released and unlinked on drop
#[derive(Debug)]
pub struct CommandLock {
    path: PathBuf,
    // Closing the descriptor releases the flock
    _file: File,
}

impl CommandLock {
    /// Lock file that guards `command_line` inside `lock_dir`
    pub fn lock_path(lock_dir: &Path, command_line: &str) -> PathBuf {
        let digest = Sha256::digest(command_line.as_bytes());
        let key = hex::encode(&digest[..8]);
        lock_dir.join(format!("timeout_wait.{}.lock", key))
    }

    /// Take the lock without blocking
    ///
    /// # Errors
    ///
    /// Returns `LockError::Busy` if another holder has it, `LockError::Io`
    /// if the directory or file cannot be created.
    pub fn acquire(lock_dir: &Path, command_line: &str) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir).map_err(|source| LockError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let path = Self::lock_path(lock_dir, command_line);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(io_err)?;

            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {}
                Err(Errno::EWOULDBLOCK) => return Err(LockError::Busy(path)),
                Err(errno) => return Err(io_err(io::Error::from(errno))),
            }

            // The previous holder unlinks on release. If that happened between
            // our open and flock we hold a lock on an orphaned inode; retry.
            let held = file.metadata().map_err(io_err)?;
            match fs::metadata(&path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    debug!("Acquired lock {:?}", path);
                    return Ok(Self { path, _file: file });
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(LockError::Busy(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CommandLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
            }
        }
    }
}
