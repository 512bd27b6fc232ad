// Configuration File Support
//
// This module provides configuration file parsing for nasrc.
// Supports TOML format with environment variable overrides.
// The configuration file is read from /usr/local/etc/nasrc.toml unless
// NASRC_CONFIG or --config points elsewhere.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/nasrc.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Filesystem locations of the database and external tools
    pub paths: PathsConfig,

    /// Timeouts applied to external commands
    pub timeouts: TimeoutsConfig,

    /// Boot-time cache filesystem
    pub cache: CacheConfig,

    /// Directory service lookups
    pub dirsrv: DirsrvConfig,

    /// Build pipeline
    pub pipeline: PipelineConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Product configuration database
    pub database: PathBuf,

    /// Directory holding timeout_wait lock files
    pub lock_dir: PathBuf,

    /// warden binary
    pub warden: String,

    /// jexec binary
    pub jexec: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/data/freenas-v1.db"),
            lock_dir: PathBuf::from("/var/run/nasrc"),
            warden: "/usr/local/bin/warden".to_string(),
            jexec: "/usr/sbin/jexec".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Timeout for ordinary tool invocations (warden, mount, mdconfig)
    pub command_secs: u64,

    /// Timeout for starting or stopping a single plugin
    pub plugin_secs: u64,

    /// Timeout for cache fill/expire commands
    pub cache_secs: u64,

    /// Grace period between SIGINT and SIGKILL
    pub kill_grace_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command_secs: 120,
            plugin_secs: 30,
            cache_secs: 300,
            kill_grace_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Mount point of the memory-backed cache filesystem
    pub mountpoint: PathBuf,

    /// Size of the memory disk in MiB, unless the database overrides it
    pub size_mb: u64,

    /// Command that fills the cache after it is mounted
    pub fill_command: Option<Vec<String>>,

    /// Command that flushes the cache before it is torn down
    pub expire_command: Option<Vec<String>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/var/tmp/.cache"),
            size_mb: 256,
            fill_command: None,
            expire_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirsrvConfig {
    /// nsswitch.conf written by `dirsrv enable`
    pub nsswitch_path: PathBuf,
}

impl Default for DirsrvConfig {
    fn default() -> Self {
        Self {
            nsswitch_path: PathBuf::from("/etc/nsswitch.conf"),
        }
    }
}

/// Build pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source checkout the stages run in
    pub workdir: PathBuf,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,
}

fn default_stage_timeout() -> u64 {
    3600
}

fn stage(name: &str, command: &[&str], timeout_secs: u64) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        timeout_secs,
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            stages: vec![
                stage("checkout", &["git", "pull", "--ff-only"], 600),
                stage("packages", &["make", "packages"], 4 * 3600),
                stage("release", &["make", "release"], 2 * 3600),
            ],
        }
    }
}

impl Config {
    /// Load configuration from `NASRC_CONFIG` or the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed
    /// or fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::debug!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Configuration file path, honouring `NASRC_CONFIG`
    pub fn config_path() -> PathBuf {
        std::env::var_os("NASRC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - NASRC_LOG_LEVEL
    /// - NASRC_LOG_FORMAT
    /// - NASRC_DATABASE
    /// - NASRC_LOCK_DIR
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("NASRC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("NASRC_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(db) = std::env::var_os("NASRC_DATABASE") {
            self.paths.database = PathBuf::from(db);
        }
        if let Some(dir) = std::env::var_os("NASRC_LOCK_DIR") {
            self.paths.lock_dir = PathBuf::from(dir);
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.cache.mountpoint.as_os_str().is_empty() {
            anyhow::bail!("Cache mount point must not be empty");
        }
        if self.cache.size_mb == 0 {
            anyhow::bail!("Cache size must be > 0");
        }
        for (name, cmd) in [
            ("fill_command", &self.cache.fill_command),
            ("expire_command", &self.cache.expire_command),
        ] {
            if matches!(cmd, Some(argv) if argv.is_empty()) {
                anyhow::bail!("Cache {} must not be an empty list", name);
            }
        }

        let mut seen = HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.name.is_empty() {
                anyhow::bail!("Pipeline stage has an empty name");
            }
            if stage.command.is_empty() {
                anyhow::bail!("Pipeline stage '{}' has an empty command", stage.name);
            }
            if !seen.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate pipeline stage: {}", stage.name);
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.paths.database, PathBuf::from("/data/freenas-v1.db"));
        assert_eq!(config.cache.mountpoint, PathBuf::from("/var/tmp/.cache"));
        assert_eq!(config.timeouts.kill_grace_secs, 1);
        assert_eq!(config.pipeline.stages.len(), 3);
        assert_eq!(config.pipeline.stages[0].name, "checkout");
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_cache_size() {
        let mut config = Config::default();
        config.cache.size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_fill_command() {
        let mut config = Config::default();
        config.cache.fill_command = Some(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_duplicate_stage() {
        let mut config = Config::default();
        let dup = config.pipeline.stages[0].clone();
        config.pipeline.stages.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate pipeline stage"));
    }

    #[test]
    fn test_config_validation_empty_stage_command() {
        let mut config = Config::default();
        config.pipeline.stages[1].command.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cache.size_mb, Config::default().cache.size_mb);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[cache]
size_mb = 512
fill_command = ["/usr/local/bin/cachetool", "fill"]

[timeouts]
plugin_secs = 5

[[pipeline.stages]]
name = "world"
command = ["make", "buildworld"]
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.cache.size_mb, 512);
        assert_eq!(
            config.cache.fill_command,
            Some(vec!["/usr/local/bin/cachetool".to_string(), "fill".to_string()])
        );
        assert_eq!(config.timeouts.plugin_secs, 5);
        assert_eq!(config.timeouts.cache_secs, 300);
        assert_eq!(config.pipeline.stages.len(), 1);
        assert_eq!(config.pipeline.stages[0].timeout_secs, 3600);
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_log_level_parse() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_serialize_roundtrip_default() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
