// nasrc - Main Entry Point
//
// Command line front end for the rc scripts and the build job:
// - timeout-wait: run a command under the timeout guard
// - jail / plugins: jail lifecycle
// - cache: boot-time cache filesystem
// - dirsrv / service: directory service lookups and service flags
// - db: generic configuration database access
// - build: the package and release pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nas_rc::cache::CacheFs;
use nas_rc::config::Config;
use nas_rc::dirsrv;
use nas_rc::exec::{CommandRunner, RunnerConfig, Shutdown, SystemRunner, TimeoutError, TimeoutWait};
use nas_rc::jail::{JailManager, PluginAction, Warden};
use nas_rc::logging;
use nas_rc::pipeline::Pipeline;
use nas_rc::store::ConfigStore;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Exit status when an identical command is already running
const EXIT_ALREADY_RUNNING: u8 = 2;

/// Exit status after SIGINT or SIGTERM
const EXIT_INTERRUPTED: u8 = 130;

/// Time for the current step to wind down after a shutdown notice, on top of
/// the kill grace
const DRAIN_MARGIN: Duration = Duration::from_secs(2);

/// nasrc: NAS boot-time orchestration
#[derive(Parser, Debug)]
#[command(name = "nasrc")]
#[command(author = "nasrc Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Boot-time orchestration for jails, plugins, cache and directory services", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: $NASRC_CONFIG or /usr/local/etc/nasrc.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command, killing it after SECS seconds
    TimeoutWait {
        /// Timeout in seconds
        secs: u64,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Jail lifecycle
    Jail {
        #[command(subcommand)]
        action: JailCommand,
    },
    /// Start or stop the plugins of a jail
    Plugins {
        #[command(subcommand)]
        action: PluginsCommand,
    },
    /// Boot-time cache filesystem
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Directory service lookups
    Dirsrv {
        #[command(subcommand)]
        action: DirsrvCommand,
    },
    /// Service enable flags
    Service {
        #[command(subcommand)]
        action: ServiceCommand,
    },
    /// Read or write the configuration database
    Db {
        #[command(subcommand)]
        action: DbCommand,
    },
    /// Run the package and release pipeline
    Build {
        /// Start at this stage
        #[arg(long)]
        from: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum JailCommand {
    /// List jails known to warden
    List {
        #[arg(long)]
        json: bool,
    },
    /// Bring a jail up: network, mounts, jail, plugins
    Start { name: String },
    /// Take a jail down: plugins, jail, mounts
    Stop { name: String },
    /// Start every autostart jail
    StartAll,
    /// Stop every running jail
    StopAll,
    /// Mount the configured directories into a jail
    Mount { name: String },
    /// Unmount the configured directories of a jail
    Unmount { name: String },
    /// Show the addresses a jail will use
    Network {
        name: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PluginsCommand {
    Start { jail: String },
    Stop { jail: String },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Create, mount and fill the cache
    Populate,
    /// Flush and destroy the cache
    Expire,
    /// Show where the cache is mounted from
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DirsrvCommand {
    /// Show enabled directory services
    Status,
    /// Regenerate nsswitch.conf
    Enable,
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// Exit 0 if the service is enabled
    Status { name: String },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Print one value
    Get {
        table: String,
        column: String,
        id: i64,
    },
    /// Update one value
    Set {
        table: String,
        column: String,
        id: i64,
        value: String,
    },
    /// Create the tables nasrc uses if they are missing
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nasrc: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config, args.verbose) {
        eprintln!("nasrc: {:#}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = match Shutdown::listen() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            error!("Cannot install signal handlers: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let app = App {
        config,
        shutdown: shutdown.clone(),
    };
    let drain = app.kill_grace() + DRAIN_MARGIN;
    let work = app.dispatch(args.command);
    tokio::pin!(work);

    tokio::select! {
        biased;
        _ = shutdown.wait() => {
            // Guarded commands stop their children on the same notice
            match time::timeout(drain, &mut work).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("{:#}", e),
                Err(_) => warn!("Abandoning the current step after {:?}", drain),
            }
            ExitCode::from(EXIT_INTERRUPTED)
        }
        result = &mut work => match result {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

fn status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

struct App {
    config: Config,
    shutdown: Shutdown,
}

impl App {
    fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.kill_grace_secs)
    }

    fn guard(&self) -> TimeoutWait {
        TimeoutWait::new(&self.config.paths.lock_dir)
            .with_kill_grace(self.kill_grace())
            .with_shutdown(self.shutdown.clone())
    }

    fn runner_with(&self, guard: TimeoutWait) -> Arc<dyn CommandRunner> {
        Arc::new(SystemRunner::new(
            RunnerConfig::with_timeout(self.config.timeouts.command_secs),
            guard,
        ))
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner_with(self.guard())
    }

    fn store(&self) -> Result<ConfigStore> {
        ConfigStore::open(&self.config.paths.database).with_context(|| {
            format!(
                "Failed to open configuration database {:?}",
                self.config.paths.database
            )
        })
    }

    fn warden(&self) -> Warden {
        Warden::new(
            self.runner(),
            self.config.paths.warden.as_str(),
            self.config.paths.jexec.as_str(),
        )
    }

    async fn dispatch(&self, command: Commands) -> Result<ExitCode> {
        match command {
            Commands::TimeoutWait { secs, command } => self.timeout_wait(secs, &command).await,
            Commands::Jail { action } => self.jail(action).await,
            Commands::Plugins { action } => self.plugins(action).await,
            Commands::Cache { action } => self.cache(action).await,
            Commands::Dirsrv { action } => self.dirsrv(action),
            Commands::Service { action } => self.service(action),
            Commands::Db { action } => self.db(action),
            Commands::Build { from, json } => self.build(from.as_deref(), json).await,
        }
    }

    async fn timeout_wait(&self, secs: u64, argv: &[String]) -> Result<ExitCode> {
        match self.guard().run(argv, secs).await {
            Ok(outcome) if outcome.success() => Ok(ExitCode::SUCCESS),
            Ok(outcome) => {
                warn!("{}: {}", argv.join(" "), outcome);
                Ok(ExitCode::FAILURE)
            }
            Err(e @ TimeoutError::AlreadyRunning { .. }) => {
                error!("{}", e);
                Ok(ExitCode::from(EXIT_ALREADY_RUNNING))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn jail(&self, action: JailCommand) -> Result<ExitCode> {
        let store = self.store()?;
        let manager = JailManager::new(&store, self.warden(), self.config.timeouts.plugin_secs);

        match action {
            JailCommand::List { json } => {
                let jails = manager.list().await?;
                if json {
                    print_json(&jails)?;
                } else {
                    for jail in &jails {
                        println!(
                            "{:<16} {:<10} {:<8} {}",
                            jail.name,
                            if jail.autostart { "autostart" } else { "-" },
                            if jail.running { "running" } else { "stopped" },
                            jail.kind
                        );
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
            JailCommand::Start { name } => {
                let report = manager.start(&name).await?;
                info!(
                    "Jail {} started ({}, {} mount(s), {} plugin(s))",
                    report.jail, report.network.ipv4, report.mounts.ok, report.plugins.ok
                );
                Ok(status(report.plugins.is_clean()))
            }
            JailCommand::Stop { name } => {
                let report = manager.stop(&name).await?;
                for failure in report.plugins.failed.iter().chain(&report.mounts.failed) {
                    println!("{}", failure);
                }
                Ok(status(report.is_clean()))
            }
            JailCommand::StartAll => {
                let reports = manager.start_all().await?;
                info!("Started {} jail(s)", reports.len());
                Ok(ExitCode::SUCCESS)
            }
            JailCommand::StopAll => {
                manager.stop_all().await?;
                Ok(ExitCode::SUCCESS)
            }
            JailCommand::Mount { name } => {
                let report = manager.mount(&name).await?;
                for failure in &report.failed {
                    println!("{}", failure);
                }
                Ok(status(report.is_clean()))
            }
            JailCommand::Unmount { name } => {
                let report = manager.unmount(&name).await?;
                for failure in &report.failed {
                    println!("{}", failure);
                }
                Ok(status(report.is_clean()))
            }
            JailCommand::Network { name, json } => {
                let network = manager.network(&name).await?;
                if json {
                    print_json(&network)?;
                } else {
                    println!("ipv4 {}", network.ipv4);
                    println!("ipv6 {}", network.ipv6);
                }
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    async fn plugins(&self, action: PluginsCommand) -> Result<ExitCode> {
        let store = self.store()?;
        let manager = JailManager::new(&store, self.warden(), self.config.timeouts.plugin_secs);
        let (jail, action) = match action {
            PluginsCommand::Start { jail } => (jail, PluginAction::Start),
            PluginsCommand::Stop { jail } => (jail, PluginAction::Stop),
        };
        let report = manager.plugins(&jail, action).await?;
        for failure in &report.failed {
            println!("{}", failure);
        }
        Ok(status(report.is_clean()))
    }

    async fn cache(&self, action: CacheCommand) -> Result<ExitCode> {
        // The size override is optional; a missing database is not fatal here
        let size_override = match self.store() {
            Ok(store) => store.cache_size_mb()?,
            Err(e) => {
                debug!("No cache size override: {:#}", e);
                None
            }
        };
        let cache = CacheFs::new(
            self.runner(),
            &self.config.cache,
            size_override,
            self.config.timeouts.cache_secs,
        );

        match action {
            CacheCommand::Populate => {
                let device = cache.populate().await?;
                info!("Cache ready on {}", device);
            }
            CacheCommand::Expire => {
                cache.expire().await?;
            }
            CacheCommand::Status { json } => {
                let status = cache.status().await?;
                if json {
                    print_json(&status)?;
                } else {
                    match &status.device {
                        Some(device) => println!("{} on {:?}", device, status.mountpoint),
                        None => println!("not mounted"),
                    }
                }
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn dirsrv(&self, action: DirsrvCommand) -> Result<ExitCode> {
        let store = self.store()?;
        match action {
            DirsrvCommand::Status => {
                let services = dirsrv::enabled_services(&store)?;
                for (name, on) in [
                    ("activedirectory", services.activedirectory),
                    ("ldap", services.ldap),
                    ("nis", services.nis),
                    ("nt4", services.nt4),
                ] {
                    println!("{:<16} {}", name, if on { "enabled" } else { "disabled" });
                }
                Ok(status(services.any()))
            }
            DirsrvCommand::Enable => {
                let path = &self.config.dirsrv.nsswitch_path;
                let active = dirsrv::enable_lookups(&store, path)?;
                if !active {
                    info!("No directory service enabled; local lookups only");
                }
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    fn service(&self, action: ServiceCommand) -> Result<ExitCode> {
        let store = self.store()?;
        match action {
            ServiceCommand::Status { name } => {
                let enabled = store.service_enabled(&name)?;
                println!("{} is {}", name, if enabled { "enabled" } else { "disabled" });
                Ok(status(enabled))
            }
            ServiceCommand::Enable { name } => {
                store.set_service_enabled(&name, true)?;
                Ok(ExitCode::SUCCESS)
            }
            ServiceCommand::Disable { name } => {
                store.set_service_enabled(&name, false)?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    fn db(&self, action: DbCommand) -> Result<ExitCode> {
        match action {
            DbCommand::Get { table, column, id } => {
                match self.store()?.get_value(&table, &column, id)? {
                    Some(value) => {
                        println!("{}", value);
                        Ok(ExitCode::SUCCESS)
                    }
                    None => Ok(ExitCode::FAILURE),
                }
            }
            DbCommand::Set {
                table,
                column,
                id,
                value,
            } => {
                self.store()?.set_value(&table, &column, id, &value)?;
                Ok(ExitCode::SUCCESS)
            }
            DbCommand::Init => {
                let path = &self.config.paths.database;
                ConfigStore::create(path)
                    .with_context(|| format!("Failed to initialize database {:?}", path))?;
                info!("Initialized {:?}", path);
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    async fn build(&self, from: Option<&str>, json: bool) -> Result<ExitCode> {
        let pipeline_config = &self.config.pipeline;
        let runner = self.runner_with(self.guard().with_working_dir(&pipeline_config.workdir));
        let pipeline = Pipeline::new(runner, pipeline_config);

        let report = pipeline.run(from).await?;
        if json {
            print_json(&report)?;
        } else {
            for stage in &report.stages {
                println!("{}", stage);
            }
        }
        Ok(status(report.success()))
    }
}
