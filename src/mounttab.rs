//! Mounted filesystem table
//!
//! Parses `mount -p` output (fstab format) so callers can tell what is
//! mounted where without tracking state of their own.

use crate::exec::CommandRunner;
use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Parse `mount -p` output; malformed lines are skipped
pub fn parse_mount_p(output: &str) -> Vec<MountEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                device: device.to_string(),
                mountpoint: PathBuf::from(mountpoint),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Current mounts, as reported by `mount -p`
pub async fn mounted(runner: &dyn CommandRunner) -> Result<Vec<MountEntry>> {
    let out = runner
        .run("mount", &["-p".to_string()])
        .await?
        .check("mount -p")?;
    Ok(parse_mount_p(&out.stdout))
}

/// The entry mounted at `mountpoint`, if any
pub fn find<'a>(entries: &'a [MountEntry], mountpoint: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|e| e.mountpoint == mountpoint)
}
