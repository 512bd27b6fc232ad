// Per-jail plugin services
//
// Plugins are rc services inside their jail. Each one is started or stopped
// with `jexec <jail> service <name> onestart|onestop` under the timeout guard,
// so a wedged plugin cannot hold up boot.

use super::warden::Warden;
use super::{BatchReport, JailError};
use crate::exec::TimeoutError;
use crate::store::{ConfigStore, Plugin};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    Start,
    Stop,
}

impl PluginAction {
    fn rc_verb(self) -> &'static str {
        match self {
            PluginAction::Start => "onestart",
            PluginAction::Stop => "onestop",
        }
    }
}

async fn run_one(
    warden: &Warden,
    jail: &str,
    plugin: &Plugin,
    action: PluginAction,
    timeout_secs: u64,
    report: &mut BatchReport,
) -> Result<(), JailError> {
    let argv = warden.jexec_argv(jail, &["service", &plugin.name, action.rc_verb()]);
    match warden.runner().run_guarded(&argv, timeout_secs).await {
        Ok(outcome) if outcome.success() => {
            info!("Plugin {} in {}: {} ok", plugin.name, jail, action.rc_verb());
            report.ok += 1;
        }
        Ok(outcome) => {
            warn!("Plugin {} in {}: {} {}", plugin.name, jail, action.rc_verb(), outcome);
            report.fail(&plugin.name, outcome);
        }
        Err(e @ TimeoutError::Interrupted { .. }) => return Err(e.into()),
        Err(e @ TimeoutError::AlreadyRunning { .. }) => {
            warn!("Plugin {} in {} is already being handled: {}", plugin.name, jail, e);
            report.fail(&plugin.name, e);
        }
        Err(e) => {
            warn!("Plugin {} in {}: {}", plugin.name, jail, e);
            report.fail(&plugin.name, e);
        }
    }
    Ok(())
}

/// Start or stop every enabled plugin of `jail`
///
/// Plugins are stopped in the reverse of their start order. Individual
/// failures are recorded in the report, not returned as errors. A shutdown
/// notice ends the batch with [`JailError::Guarded`].
pub async fn run_plugins(
    warden: &Warden,
    store: &ConfigStore,
    jail: &str,
    action: PluginAction,
    timeout_secs: u64,
) -> Result<BatchReport, JailError> {
    let mut plugins = store.enabled_plugins(jail)?;
    if action == PluginAction::Stop {
        plugins.reverse();
    }

    let mut report = BatchReport::default();
    for plugin in &plugins {
        run_one(warden, jail, plugin, action, timeout_secs, &mut report).await?;
    }
    Ok(report)
}
