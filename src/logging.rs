// Logging setup
//
// Output goes to stderr so command output on stdout (including --json) stays
// machine readable. RUST_LOG, when set, takes precedence over the level from
// the configuration file.

use crate::config::Config;
use anyhow::Result;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Filter for the configured level, raised to DEBUG by `-v`
pub fn env_filter(config: &Config, verbose: bool) -> Result<EnvFilter> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy())
}

/// Install the global subscriber in the configured format
pub fn init(config: &Config, verbose: bool) -> Result<()> {
    let filter = env_filter(config, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn test_filter_from_config_level() {
        let mut config = Config::default();
        config.logging.level = "warn".to_string();
        assert!(env_filter(&config, false).is_ok());
    }

    #[test]
    fn test_filter_rejects_bad_level() {
        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(env_filter(&config, false).is_err());
    }

    #[test]
    fn test_json_subscriber_captures_fields() {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            info!(jail = "plex", "Jail started");
            debug!("filtered out at the default level");
        });
    }
}
