// warden / jexec driver
//
// warden owns jail creation, networking and startup; this is a thin typed
// wrapper over its command line and the text it prints.

use crate::exec::CommandRunner;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("warden {action} failed: {detail}")]
    Command { action: String, detail: String },

    #[error("unrecognized warden output: {0:?}")]
    Parse(String),

    #[error(transparent)]
    Exec(#[from] anyhow::Error),
}

/// One row of `warden list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JailInfo {
    pub name: String,
    pub autostart: bool,
    pub running: bool,
    pub kind: String,
}

/// Address assigned to a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JailAddress {
    None,
    Dhcp,
    Static { addr: IpAddr, prefix: u8 },
}

impl JailAddress {
    /// Parse `addr[/prefix]`, `DHCP`/`AUTOCONF`, or empty
    pub fn parse(s: &str) -> Result<Self, WardenError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(JailAddress::None);
        }
        if s.eq_ignore_ascii_case("dhcp") || s.eq_ignore_ascii_case("autoconf") {
            return Ok(JailAddress::Dhcp);
        }

        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| WardenError::Parse(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|&p| p <= max)
                .ok_or_else(|| WardenError::Parse(s.to_string()))?,
            None if addr.is_ipv4() => 24,
            None => 64,
        };
        Ok(JailAddress::Static { addr, prefix })
    }
}

impl fmt::Display for JailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JailAddress::None => write!(f, "none"),
            JailAddress::Dhcp => write!(f, "DHCP"),
            JailAddress::Static { addr, prefix } => write!(f, "{}/{}", addr, prefix),
        }
    }
}

/// Parse `warden list` output
///
/// ```text
/// JAIL            AUTOSTART    STATUS    TYPE
/// -------------------------------------------------
/// plex            Enabled      Running   pluginjail
/// ```
pub fn parse_list(output: &str) -> Vec<JailInfo> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    // Rows start after the dashed separator; without one, after the header line
    let first_row = match lines.iter().position(|l| l.starts_with("---")) {
        Some(sep) => sep + 1,
        None => 1,
    };

    lines
        .iter()
        .skip(first_row)
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            let cols: Vec<&str> = l.split_whitespace().collect();
            if cols.len() < 3 {
                return None;
            }
            Some(JailInfo {
                name: cols[0].to_string(),
                autostart: cols[1].eq_ignore_ascii_case("enabled"),
                running: cols[2].eq_ignore_ascii_case("running"),
                kind: cols.get(3).copied().unwrap_or("standard").to_string(),
            })
        })
        .collect()
}

/// Typed front end for the warden binary
#[derive(Clone)]
pub struct Warden {
    runner: Arc<dyn CommandRunner>,
    warden: String,
    jexec: String,
}

impl Warden {
    pub fn new(runner: Arc<dyn CommandRunner>, warden: impl Into<String>, jexec: impl Into<String>) -> Self {
        Self {
            runner,
            warden: warden.into(),
            jexec: jexec.into(),
        }
    }

    async fn call(&self, action: &str, args: &[&str]) -> Result<String, WardenError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        debug!("warden {}", args.join(" "));
        let out = self.runner.run(&self.warden, &args).await?;
        if !out.success {
            return Err(WardenError::Command {
                action: action.to_string(),
                detail: out.summary(),
            });
        }
        Ok(out.stdout)
    }

    pub async fn list(&self) -> Result<Vec<JailInfo>, WardenError> {
        let out = self.call("list", &["list"]).await?;
        Ok(parse_list(&out))
    }

    pub async fn find(&self, jail: &str) -> Result<Option<JailInfo>, WardenError> {
        Ok(self.list().await?.into_iter().find(|j| j.name == jail))
    }

    pub async fn start(&self, jail: &str) -> Result<(), WardenError> {
        info!("Starting jail {}", jail);
        self.call("start", &["start", jail]).await.map(|_| ())
    }

    pub async fn stop(&self, jail: &str) -> Result<(), WardenError> {
        info!("Stopping jail {}", jail);
        self.call("stop", &["stop", jail]).await.map(|_| ())
    }

    pub async fn get_ipv4(&self, jail: &str) -> Result<JailAddress, WardenError> {
        let out = self.call("get ipv4", &["get", "ipv4", jail]).await?;
        JailAddress::parse(out.lines().next().unwrap_or(""))
    }

    pub async fn get_ipv6(&self, jail: &str) -> Result<JailAddress, WardenError> {
        let out = self.call("get ipv6", &["get", "ipv6", jail]).await?;
        JailAddress::parse(out.lines().next().unwrap_or(""))
    }

    pub async fn set_ipv4(&self, jail: &str, address: &JailAddress) -> Result<(), WardenError> {
        let value = address.to_string();
        info!("Assigning {} to jail {}", value, jail);
        self.call("set ipv4", &["set", "ipv4", jail, &value])
            .await
            .map(|_| ())
    }

    /// argv that runs `command` inside `jail`
    pub fn jexec_argv(&self, jail: &str, command: &[&str]) -> Vec<String> {
        let mut argv = vec![self.jexec.clone(), jail.to_string()];
        argv.extend(command.iter().map(|s| s.to_string()));
        argv
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }
}
