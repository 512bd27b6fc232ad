// Jail filesystem mounts
//
// Each jail may have host directories nullfs-mounted under its root. The
// database records which ones; `mount -p` is the authority on what is
// actually mounted right now.

use super::{BatchReport, JailError};
use crate::exec::CommandRunner;
use crate::mounttab;
use crate::store::{ConfigStore, MountPoint};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Absolute path of a mount point's destination inside the jail root
///
/// Rejects destinations that would escape the root.
pub fn jail_destination(jail_root: &Path, mount: &MountPoint) -> Result<PathBuf, JailError> {
    let mut dest = jail_root.to_path_buf();
    for component in mount.destination.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => dest.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(JailError::UnsafeDestination {
                    jail: mount.jail.clone(),
                    destination: mount.destination.clone(),
                })
            }
        }
    }
    if dest == jail_root {
        return Err(JailError::UnsafeDestination {
            jail: mount.jail.clone(),
            destination: mount.destination.clone(),
        });
    }
    Ok(dest)
}

fn nullfs_args(mount: &MountPoint, dest: &Path) -> Vec<String> {
    let mut args = Vec::new();
    if mount.readonly {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    args.push(mount.source.display().to_string());
    args.push(dest.display().to_string());
    args
}

/// Mount every configured host directory into `jail`
pub async fn mount_all(
    runner: &dyn CommandRunner,
    store: &ConfigStore,
    jail_root: &Path,
    jail: &str,
) -> Result<BatchReport, JailError> {
    let mut report = BatchReport::default();
    let current = mounttab::mounted(runner).await?;

    for mount in store.jail_mountpoints(jail)? {
        let dest = match jail_destination(jail_root, &mount) {
            Ok(d) => d,
            Err(e) => {
                warn!("{}", e);
                report.fail(mount.destination.display(), e);
                continue;
            }
        };

        if mounttab::find(&current, &dest).is_some() {
            store.set_mountpoint_mounted(mount.id, true)?;
            report.skipped += 1;
            continue;
        }

        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            warn!("Cannot create {:?}: {}", dest, e);
            report.fail(dest.display(), e);
            continue;
        }

        let out = runner.run("mount_nullfs", &nullfs_args(&mount, &dest)).await?;
        if out.success {
            info!("Mounted {:?} on {:?}", mount.source, dest);
            store.set_mountpoint_mounted(mount.id, true)?;
            report.ok += 1;
        } else {
            warn!("mount_nullfs {:?} failed: {}", dest, out.summary());
            report.fail(dest.display(), out.summary());
        }
    }

    Ok(report)
}

/// Unmount `jail`'s host directories, last mounted first
///
/// Keeps going past failures so one busy mount does not pin the rest.
pub async fn unmount_all(
    runner: &dyn CommandRunner,
    store: &ConfigStore,
    jail_root: &Path,
    jail: &str,
) -> Result<BatchReport, JailError> {
    let mut report = BatchReport::default();
    let current = mounttab::mounted(runner).await?;

    for mount in store.jail_mountpoints(jail)?.into_iter().rev() {
        let dest = match jail_destination(jail_root, &mount) {
            Ok(d) => d,
            Err(e) => {
                report.fail(mount.destination.display(), e);
                continue;
            }
        };

        if mounttab::find(&current, &dest).is_none() {
            store.set_mountpoint_mounted(mount.id, false)?;
            report.skipped += 1;
            continue;
        }

        let out = runner
            .run("umount", &["-f".to_string(), dest.display().to_string()])
            .await?;
        if out.success {
            info!("Unmounted {:?}", dest);
            store.set_mountpoint_mounted(mount.id, false)?;
            report.ok += 1;
        } else {
            warn!("umount {:?} failed: {}", dest, out.summary());
            report.fail(dest.display(), out.summary());
        }
    }

    Ok(report)
}
