//! Boot-time Cache Filesystem
//!
//! A swap-backed memory disk (`mdconfig -t swap`) formatted with UFS and
//! mounted at the cache mount point. `populate` creates and fills it at boot,
//! `expire` flushes and destroys it at shutdown. Both are idempotent: the
//! mount table decides whether there is anything to do.

use crate::config::CacheConfig;
use crate::exec::{CommandRunner, TimeoutError, WaitOutcome};
use crate::mounttab;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{step} failed: {detail}")]
    Command { step: &'static str, detail: String },

    #[error("unexpected mdconfig output: {0:?}")]
    BadDevice(String),

    #[error("cache {hook} command {outcome}")]
    HookFailed {
        hook: &'static str,
        outcome: WaitOutcome,
    },

    #[error(transparent)]
    Guarded(#[from] TimeoutError),

    #[error("cannot create {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] anyhow::Error),
}

/// Where the cache currently lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub mountpoint: PathBuf,
    /// Backing device, e.g. `/dev/md3`, when mounted
    pub device: Option<String>,
    pub size_mb: u64,
}

/// The cache filesystem and the commands that manage it
pub struct CacheFs {
    runner: Arc<dyn CommandRunner>,
    mountpoint: PathBuf,
    size_mb: u64,
    fill_command: Option<Vec<String>>,
    expire_command: Option<Vec<String>>,
    hook_timeout_secs: u64,
}

impl CacheFs {
    /// Build from configuration; a positive `size_override_mb` from the
    /// database wins over the configured size
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &CacheConfig,
        size_override_mb: Option<u64>,
        hook_timeout_secs: u64,
    ) -> Self {
        Self {
            runner,
            mountpoint: config.mountpoint.clone(),
            size_mb: size_override_mb.filter(|&mb| mb > 0).unwrap_or(config.size_mb),
            fill_command: config.fill_command.clone(),
            expire_command: config.expire_command.clone(),
            hook_timeout_secs,
        }
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub async fn status(&self) -> Result<CacheStatus, CacheError> {
        let entries = mounttab::mounted(self.runner.as_ref()).await?;
        Ok(CacheStatus {
            mountpoint: self.mountpoint.clone(),
            device: mounttab::find(&entries, &self.mountpoint).map(|e| e.device.clone()),
            size_mb: self.size_mb,
        })
    }

    async fn tool(&self, step: &'static str, program: &str, args: &[&str]) -> Result<String, CacheError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let out = self.runner.run(program, &args).await?;
        if !out.success {
            return Err(CacheError::Command {
                step,
                detail: out.summary(),
            });
        }
        Ok(out.stdout)
    }

    async fn hook(&self, hook: &'static str, argv: &Option<Vec<String>>) -> Result<(), CacheError> {
        let Some(argv) = argv else {
            return Ok(());
        };
        let outcome = self.runner.run_guarded(argv, self.hook_timeout_secs).await?;
        if !outcome.success() {
            return Err(CacheError::HookFailed { hook, outcome });
        }
        Ok(())
    }

    async fn detach(&self, unit: &str) -> Result<(), CacheError> {
        self.tool("mdconfig -d", "mdconfig", &["-d", "-u", unit])
            .await
            .map(|_| ())
    }

    /// Create, mount and fill the cache
    ///
    /// Returns the backing device. An already mounted cache is only refilled.
    pub async fn populate(&self) -> Result<String, CacheError> {
        let device = match self.status().await?.device {
            Some(device) => {
                info!("Cache already mounted from {}", device);
                device
            }
            None => self.create().await?,
        };

        self.hook("fill", &self.fill_command).await?;
        Ok(device)
    }

    async fn create(&self) -> Result<String, CacheError> {
        let size = format!("{}m", self.size_mb);
        let out = self
            .tool("mdconfig -a", "mdconfig", &["-a", "-t", "swap", "-s", &size])
            .await?;
        let unit = out.trim().to_string();
        if !unit.starts_with("md") || unit.contains(char::is_whitespace) {
            return Err(CacheError::BadDevice(unit));
        }
        let device = format!("/dev/{}", unit);

        if let Err(e) = self.format_and_mount(&device).await {
            warn!("Cache setup failed, detaching {}: {}", unit, e);
            if let Err(detach_err) = self.detach(&unit).await {
                warn!("{}", detach_err);
            }
            return Err(e);
        }

        info!("Cache mounted at {:?} from {} ({})", self.mountpoint, device, size);
        Ok(device)
    }

    async fn format_and_mount(&self, device: &str) -> Result<(), CacheError> {
        self.tool("newfs", "newfs", &["-U", device]).await?;
        tokio::fs::create_dir_all(&self.mountpoint)
            .await
            .map_err(|source| CacheError::Io {
                path: self.mountpoint.clone(),
                source,
            })?;
        let mountpoint = self.mountpoint.display().to_string();
        self.tool("mount", "mount", &[device, &mountpoint]).await?;
        Ok(())
    }

    /// Flush and destroy the cache
    ///
    /// Returns `false` when there was no cache mounted.
    pub async fn expire(&self) -> Result<bool, CacheError> {
        let Some(device) = self.status().await?.device else {
            info!("Cache is not mounted at {:?}", self.mountpoint);
            return Ok(false);
        };

        if let Err(e) = self.hook("expire", &self.expire_command).await {
            warn!("{}", e);
        }

        let mountpoint = self.mountpoint.display().to_string();
        self.tool("umount", "umount", &[&mountpoint]).await?;

        match device.strip_prefix("/dev/") {
            Some(unit) if unit.starts_with("md") => self.detach(unit).await?,
            _ => warn!("Cache was backed by {}, not a memory disk; leaving it", device),
        }

        info!("Cache at {:?} expired", self.mountpoint);
        Ok(true)
    }
}
