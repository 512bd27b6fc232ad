//! Configuration Database Accessors
//!
//! Read and update rows of the product's SQLite configuration database.
//! Values are always bound as parameters; only table and column names given
//! on the command line are interpolated, and those go through
//! [`quote_ident`](crate::escape::quote_ident).
//!
//! Single-row settings tables may be empty or absent on a trimmed database;
//! their accessors fall back to "disabled" rather than failing.

mod schema;

pub use schema::SCHEMA;

use crate::escape::{quote_ident, sql_quote, InvalidIdentifier};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// The web UI may hold a write lock briefly
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot open configuration database {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("no row in {table} matching {key}")]
    NotFound { table: &'static str, key: String },
}

/// Jail subsystem settings (single row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct JailsConfig {
    /// Directory containing every jail root
    pub path: PathBuf,
    pub ipv4_network: Option<String>,
    pub ipv4_network_start: Option<String>,
    pub ipv4_network_end: Option<String>,
    pub ipv6_network: Option<String>,
    pub ipv6_network_start: Option<String>,
    pub ipv6_network_end: Option<String>,
    pub collection_url: Option<String>,
}

/// A host directory exposed inside a jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub id: i64,
    pub jail: String,
    pub source: PathBuf,
    /// Path relative to the jail root
    pub destination: PathBuf,
    pub readonly: bool,
    pub mounted: bool,
}

/// An installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plugin {
    pub id: i64,
    pub name: String,
    pub pbi_name: String,
    pub version: String,
    pub enabled: bool,
    pub ip: String,
    pub port: i64,
    pub path: String,
    pub jail: String,
}

/// Which directory services are switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct DirectoryServices {
    pub activedirectory: bool,
    pub ldap: bool,
    pub nis: bool,
    pub nt4: bool,
}

impl DirectoryServices {
    pub fn any(&self) -> bool {
        self.activedirectory || self.ldap || self.nis || self.nt4
    }
}

/// Handle on the configuration database
#[derive(Debug)]
pub struct ConfigStore {
    conn: Connection,
}

/// True when the error means the table is not part of this database
fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table"))
}

/// Run a single-value query, treating a missing row or table as `None`
fn optional<T>(result: rusqlite::Result<T>) -> StoreResult<Option<T>> {
    match result.optional() {
        Ok(v) => Ok(v),
        Err(e) if is_missing_table(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn plugin_from_row(row: &Row<'_>) -> rusqlite::Result<Plugin> {
    Ok(Plugin {
        id: row.get(0)?,
        name: row.get(1)?,
        pbi_name: row.get(2)?,
        version: row.get(3)?,
        enabled: row.get(4)?,
        ip: row.get(5)?,
        port: row.get(6)?,
        path: row.get(7)?,
        jail: row.get(8)?,
    })
}

const PLUGIN_COLUMNS: &str = "id, plugin_name, plugin_pbiname, plugin_version, plugin_enabled, \
     plugin_ip, plugin_port, plugin_path, plugin_jail";

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(hex::encode(b)),
    }
}

impl ConfigStore {
    /// Open an existing database
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!("Opened configuration database {:?}", path);
        Ok(Self { conn })
    }

    /// Create a database (if needed) with the tables nasrc reads
    pub fn create(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Self {
        let store = Self {
            conn: Connection::open_in_memory().unwrap(),
        };
        store.init_schema().unwrap();
        store
    }

    pub fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Raw connection, for seeding rows
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // Services

    pub fn service_enabled(&self, service: &str) -> StoreResult<bool> {
        let enabled = optional(self.conn.query_row(
            "SELECT srv_enable FROM services_services WHERE srv_service = ?1 \
             ORDER BY id DESC LIMIT 1",
            params![service],
            |row| row.get::<_, bool>(0),
        ))?;
        Ok(enabled.unwrap_or(false))
    }

    pub fn set_service_enabled(&self, service: &str, enabled: bool) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE services_services SET srv_enable = ?1 WHERE srv_service = ?2",
            params![enabled, service],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                table: "services_services",
                key: service.to_string(),
            });
        }
        debug!("Service {} enable={}", service, enabled);
        Ok(())
    }

    // Jails

    pub fn jails_config(&self) -> StoreResult<Option<JailsConfig>> {
        optional(self.conn.query_row(
            "SELECT jc_path, jc_ipv4_network, jc_ipv4_network_start, jc_ipv4_network_end, \
                    jc_ipv6_network, jc_ipv6_network_start, jc_ipv6_network_end, \
                    jc_collectionurl \
             FROM jails_jailsconfiguration ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(JailsConfig {
                    path: PathBuf::from(row.get::<_, String>(0)?),
                    ipv4_network: row.get(1)?,
                    ipv4_network_start: row.get(2)?,
                    ipv4_network_end: row.get(3)?,
                    ipv6_network: row.get(4)?,
                    ipv6_network_start: row.get(5)?,
                    ipv6_network_end: row.get(6)?,
                    collection_url: row.get(7)?,
                })
            },
        ))
    }

    pub fn jail_mountpoints(&self, jail: &str) -> StoreResult<Vec<MountPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, jail, source, destination, readonly, mounted \
             FROM jails_jailmountpoint WHERE jail = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![jail], |row| {
            Ok(MountPoint {
                id: row.get(0)?,
                jail: row.get(1)?,
                source: PathBuf::from(row.get::<_, String>(2)?),
                destination: PathBuf::from(row.get::<_, String>(3)?),
                readonly: row.get(4)?,
                mounted: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_mountpoint_mounted(&self, id: i64, mounted: bool) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE jails_jailmountpoint SET mounted = ?1 WHERE id = ?2",
            params![mounted, id],
        )?;
        Ok(())
    }

    // Plugins

    /// Plugins of one jail, or of every jail
    pub fn plugins(&self, jail: Option<&str>) -> StoreResult<Vec<Plugin>> {
        let plugins = match jail {
            Some(jail) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM plugins_plugins WHERE plugin_jail = ?1 ORDER BY id",
                    PLUGIN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![jail], plugin_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM plugins_plugins ORDER BY id",
                    PLUGIN_COLUMNS
                ))?;
                let rows = stmt.query_map([], plugin_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(plugins)
    }

    pub fn enabled_plugins(&self, jail: &str) -> StoreResult<Vec<Plugin>> {
        Ok(self
            .plugins(Some(jail))?
            .into_iter()
            .filter(|p| p.enabled)
            .collect())
    }

    pub fn set_plugin_enabled(&self, name: &str, jail: &str, enabled: bool) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE plugins_plugins SET plugin_enabled = ?1 \
             WHERE plugin_name = ?2 AND plugin_jail = ?3",
            params![enabled, name, jail],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                table: "plugins_plugins",
                key: format!("{}@{}", name, jail),
            });
        }
        Ok(())
    }

    // Directory services

    fn flag(&self, table: &str, column: &str) -> StoreResult<bool> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id DESC LIMIT 1",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let value = optional(self.conn.query_row(&sql, [], |row| row.get::<_, bool>(0)))?;
        Ok(value.unwrap_or(false))
    }

    pub fn directory_services(&self) -> StoreResult<DirectoryServices> {
        Ok(DirectoryServices {
            activedirectory: self.flag("directoryservice_activedirectory", "ad_enable")?,
            ldap: self.flag("directoryservice_ldap", "ldap_enable")?,
            nis: self.flag("directoryservice_nis", "nis_enable")?,
            nt4: self.flag("directoryservice_nt4", "nt4_enable")?,
        })
    }

    // System

    /// Cache size override; `None` when unset or zero
    pub fn cache_size_mb(&self) -> StoreResult<Option<u64>> {
        let size = optional(self.conn.query_row(
            "SELECT adv_cachesize_mb FROM system_advanced ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        ))?;
        Ok(size.filter(|&mb| mb > 0).map(|mb| mb as u64))
    }

    // Generic accessors

    pub fn get_value(&self, table: &str, column: &str, id: i64) -> StoreResult<Option<String>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let value = self
            .conn
            .query_row(&sql, params![id], |row| row.get::<_, Value>(0))
            .optional()?;
        Ok(value.and_then(value_to_string))
    }

    pub fn set_value(&self, table: &str, column: &str, id: i64, value: &str) -> StoreResult<()> {
        let (table_q, column_q) = (quote_ident(table)?, quote_ident(column)?);
        debug!(
            "UPDATE {} SET {} = {} WHERE id = {}",
            table_q,
            column_q,
            sql_quote(value),
            id
        );
        let sql = format!("UPDATE {} SET {} = ?1 WHERE id = ?2", table_q, column_q);
        let changed = self.conn.execute(&sql, params![value, id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                table: "(generic)",
                key: format!("{}.{} id={}", table, column, id),
            });
        }
        Ok(())
    }
}
