// Jail lifecycle coordination
//
// This module drives the jail subsystem at boot and shutdown:
// - warden.rs: typed wrapper around the warden and jexec binaries
// - network.rs: address resolution from warden and the jail range
// - mounts.rs: nullfs mounts of host directories into jails
// - plugins.rs: per-jail plugin services
//
// Start order: network → mounts → warden start → plugins.
// Stop order is the reverse.

pub mod mounts;
pub mod network;
pub mod plugins;
pub mod warden;


pub use network::{allocate_ipv4, resolve_network, JailNetwork};
pub use plugins::PluginAction;
pub use warden::{JailAddress, JailInfo, Warden, WardenError};

use crate::exec::TimeoutError;
use crate::store::{ConfigStore, JailsConfig, StoreError};
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum JailError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Warden(#[from] WardenError),

    #[error("jails are not configured (no jails_jailsconfiguration row)")]
    NotConfigured,

    #[error("unknown jail: {0}")]
    UnknownJail(String),

    #[error("mount destination {destination:?} escapes the root of jail {jail}")]
    UnsafeDestination { jail: String, destination: PathBuf },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no free address in {start}-{end}")]
    NoFreeAddress { start: String, end: String },

    #[error("{count} mount(s) failed for jail {jail}")]
    MountsFailed { jail: String, count: usize },

    #[error("{count} jail(s) failed")]
    JailsFailed { count: usize },

    #[error(transparent)]
    Guarded(#[from] TimeoutError),

    #[error(transparent)]
    Exec(#[from] anyhow::Error),
}

impl JailError {
    /// Whether a shutdown notice cut the operation short
    pub fn is_interrupted(&self) -> bool {
        matches!(self, JailError::Guarded(TimeoutError::Interrupted { .. }))
    }
}

/// Tally of a batch of per-item operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub ok: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

impl BatchReport {
    pub fn fail(&mut self, what: impl Display, why: impl Display) {
        self.failed.push(format!("{}: {}", what, why));
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What happened when a jail was brought up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JailStartReport {
    pub jail: String,
    pub network: JailNetwork,
    pub mounts: BatchReport,
    pub plugins: BatchReport,
}

/// What happened when a jail was taken down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JailStopReport {
    pub jail: String,
    pub plugins: BatchReport,
    pub mounts: BatchReport,
}

impl JailStopReport {
    pub fn is_clean(&self) -> bool {
        self.plugins.is_clean() && self.mounts.is_clean()
    }
}

/// Coordinates warden, the database and the plugin services
pub struct JailManager<'a> {
    store: &'a ConfigStore,
    warden: Warden,
    plugin_timeout_secs: u64,
}

impl<'a> JailManager<'a> {
    pub fn new(store: &'a ConfigStore, warden: Warden, plugin_timeout_secs: u64) -> Self {
        Self {
            store,
            warden,
            plugin_timeout_secs,
        }
    }

    pub fn warden(&self) -> &Warden {
        &self.warden
    }

    fn config(&self) -> Result<JailsConfig, JailError> {
        self.store.jails_config()?.ok_or(JailError::NotConfigured)
    }

    fn jail_root(&self, config: &JailsConfig, jail: &str) -> PathBuf {
        config.path.join(jail)
    }

    async fn lookup(&self, jail: &str) -> Result<JailInfo, JailError> {
        self.warden
            .find(jail)
            .await?
            .ok_or_else(|| JailError::UnknownJail(jail.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<JailInfo>, JailError> {
        Ok(self.warden.list().await?)
    }

    pub async fn network(&self, jail: &str) -> Result<JailNetwork, JailError> {
        self.lookup(jail).await?;
        let config = self.config()?;
        resolve_network(&self.warden, &config, jail).await
    }

    pub async fn mount(&self, jail: &str) -> Result<BatchReport, JailError> {
        let config = self.config()?;
        let root = self.jail_root(&config, jail);
        mounts::mount_all(self.warden.runner().as_ref(), self.store, &root, jail).await
    }

    pub async fn unmount(&self, jail: &str) -> Result<BatchReport, JailError> {
        let config = self.config()?;
        let root = self.jail_root(&config, jail);
        mounts::unmount_all(self.warden.runner().as_ref(), self.store, &root, jail).await
    }

    pub async fn plugins(&self, jail: &str, action: PluginAction) -> Result<BatchReport, JailError> {
        plugins::run_plugins(&self.warden, self.store, jail, action, self.plugin_timeout_secs).await
    }

    /// Bring `jail` up: address, mounts, jail, plugins
    ///
    /// A mount failure aborts before the jail is started; plugin failures
    /// are only reported.
    pub async fn start(&self, jail: &str) -> Result<JailStartReport, JailError> {
        let info = self.lookup(jail).await?;
        let config = self.config()?;

        let network = resolve_network(&self.warden, &config, jail).await?;
        if network.allocated {
            self.warden.set_ipv4(jail, &network.ipv4).await?;
        }

        let root = self.jail_root(&config, jail);
        let mounts =
            mounts::mount_all(self.warden.runner().as_ref(), self.store, &root, jail).await?;
        if !mounts.is_clean() {
            return Err(JailError::MountsFailed {
                jail: jail.to_string(),
                count: mounts.failed.len(),
            });
        }

        if info.running {
            info!("Jail {} is already running", jail);
        } else {
            self.warden.start(jail).await?;
        }

        let plugins = self.plugins(jail, PluginAction::Start).await?;
        if !plugins.is_clean() {
            warn!("Jail {}: {} plugin(s) failed to start", jail, plugins.failed.len());
        }

        Ok(JailStartReport {
            jail: jail.to_string(),
            network,
            mounts,
            plugins,
        })
    }

    /// Take `jail` down: plugins, jail, mounts
    pub async fn stop(&self, jail: &str) -> Result<JailStopReport, JailError> {
        let info = self.lookup(jail).await?;

        let plugins = self.plugins(jail, PluginAction::Stop).await?;
        if !plugins.is_clean() {
            warn!("Jail {}: {} plugin(s) failed to stop", jail, plugins.failed.len());
        }

        if info.running {
            self.warden.stop(jail).await?;
        } else {
            info!("Jail {} is not running", jail);
        }

        let mounts = self.unmount(jail).await?;
        Ok(JailStopReport {
            jail: jail.to_string(),
            plugins,
            mounts,
        })
    }

    /// Start every autostart jail that is not running
    pub async fn start_all(&self) -> Result<Vec<JailStartReport>, JailError> {
        let mut reports = Vec::new();
        let mut failures = 0;
        for jail in self.list().await? {
            if !jail.autostart || jail.running {
                continue;
            }
            match self.start(&jail.name).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    error!("Failed to start jail {}: {}", jail.name, e);
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(JailError::JailsFailed { count: failures });
        }
        Ok(reports)
    }

    /// Stop every running jail
    pub async fn stop_all(&self) -> Result<(), JailError> {
        let mut failures = 0;
        for jail in self.list().await? {
            if !jail.running {
                continue;
            }
            match self.stop(&jail.name).await {
                Ok(_) => {}
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    error!("Failed to stop jail {}: {}", jail.name, e);
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(JailError::JailsFailed { count: failures });
        }
        Ok(())
    }
}
