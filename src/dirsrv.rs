// Directory service lookups
//
// When Active Directory, NT4, LDAP or NIS is enabled in the database, user and
// group lookups have to go through the matching NSS module. nsswitch.conf is
// regenerated from the database on every call.

use crate::store::{ConfigStore, DirectoryServices, StoreError};
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum DirsrvError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn enabled_services(store: &ConfigStore) -> Result<DirectoryServices, StoreError> {
    store.directory_services()
}

/// NSS sources for the user and group databases
fn account_sources(services: &DirectoryServices) -> String {
    let mut sources = vec!["files"];
    if services.activedirectory || services.nt4 {
        sources.push("winbind");
    }
    if services.ldap {
        sources.push("ldap");
    }
    if services.nis {
        sources.push("nis");
    }
    sources.join(" ")
}

/// Render nsswitch.conf for the given set of directory services
pub fn render_nsswitch(services: &DirectoryServices) -> String {
    let accounts = account_sources(services);
    format!(
        "\
group: {accounts}
group_compat: nis
hosts: files dns
networks: files
passwd: {accounts}
passwd_compat: nis
shells: files
services: compat
services_compat: nis
protocols: files
rpc: files
"
    )
}

/// Mode for a freshly created nsswitch.conf
const DEFAULT_MODE: u32 = 0o644;

/// Replace `path` with `contents`, keeping the mode of the file it replaces
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;

    // The temp file starts out 0600; everyone has to be able to read the result
    let perms = match fs::metadata(path) {
        Ok(meta) => meta.permissions(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Permissions::from_mode(DEFAULT_MODE)
        }
        Err(e) => return Err(e),
    };
    tmp.as_file().set_permissions(perms)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Regenerate `path` from the database
///
/// Returns whether any directory service is enabled.
pub fn enable_lookups(store: &ConfigStore, path: &Path) -> Result<bool, DirsrvError> {
    let services = enabled_services(store)?;
    debug!("Directory services: {:?}", services);

    write_atomic(path, &render_nsswitch(&services)).map_err(|source| DirsrvError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Wrote {:?} ({})", path, account_sources(&services));
    Ok(services.any())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line<'a>(text: &'a str, db: &str) -> &'a str {
        text.lines()
            .find(|l| l.split(':').next() == Some(db))
            .unwrap()
    }

    #[test]
    fn test_render_files_only() {
        let text = render_nsswitch(&DirectoryServices::default());
        assert_eq!(line(&text, "passwd"), "passwd: files");
        assert_eq!(line(&text, "group"), "group: files");
        assert_eq!(line(&text, "hosts"), "hosts: files dns");
    }

    #[test]
    fn test_render_source_order() {
        let services = DirectoryServices {
            activedirectory: true,
            ldap: true,
            nis: true,
            nt4: false,
        };
        let text = render_nsswitch(&services);
        assert_eq!(line(&text, "passwd"), "passwd: files winbind ldap nis");
        assert_eq!(line(&text, "group"), "group: files winbind ldap nis");
    }

    #[test]
    fn test_render_nt4_uses_winbind_once() {
        let services = DirectoryServices {
            activedirectory: true,
            nt4: true,
            ..Default::default()
        };
        let text = render_nsswitch(&services);
        assert_eq!(line(&text, "group"), "group: files winbind");
    }

    #[test]
    fn test_enable_lookups_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsswitch.conf");
        std::fs::write(&path, "stale\n").unwrap();

        let store = ConfigStore::open_in_memory();
        store
            .connection()
            .execute("INSERT INTO directoryservice_ldap (ldap_enable) VALUES (1)", [])
            .unwrap();

        assert!(enable_lookups(&store, &path).unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("passwd: files ldap\n"));
        assert!(!text.contains("stale"));
        // Only the target is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_enable_lookups_keeps_existing_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsswitch.conf");
        fs::write(&path, "stale\n").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let store = ConfigStore::open_in_memory();
        enable_lookups(&store, &path).unwrap();
        assert_eq!(mode(&path), 0o644);

        fs::set_permissions(&path, Permissions::from_mode(0o640)).unwrap();
        enable_lookups(&store, &path).unwrap();
        assert_eq!(mode(&path), 0o640);
    }

    #[test]
    fn test_enable_lookups_new_file_is_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsswitch.conf");

        enable_lookups(&ConfigStore::open_in_memory(), &path).unwrap();
        assert_eq!(mode(&path), 0o644);
    }

    #[test]
    fn test_enable_lookups_none_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsswitch.conf");
        let store = ConfigStore::open_in_memory();

        assert!(!enable_lookups(&store, &path).unwrap());
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("group: files\n"));
    }

    #[test]
    fn test_enable_lookups_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("nsswitch.conf");
        let store = ConfigStore::open_in_memory();

        let err = enable_lookups(&store, &path).unwrap_err();
        assert!(matches!(err, DirsrvError::Write { .. }));
    }
}
