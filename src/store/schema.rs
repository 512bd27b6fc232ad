// Configuration database tables read by nasrc
//
// The database belongs to the web UI; these are the columns nasrc touches.
// `init_schema` creates them on an empty database (fresh installs, tests).

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services_services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    srv_service VARCHAR(120) NOT NULL,
    srv_enable BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS jails_jailsconfiguration (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    jc_path VARCHAR(1024) NOT NULL,
    jc_ipv4_network VARCHAR(120),
    jc_ipv4_network_start VARCHAR(120),
    jc_ipv4_network_end VARCHAR(120),
    jc_ipv6_network VARCHAR(120),
    jc_ipv6_network_start VARCHAR(120),
    jc_ipv6_network_end VARCHAR(120),
    jc_collectionurl VARCHAR(255)
);

CREATE TABLE IF NOT EXISTS jails_jailmountpoint (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    jail VARCHAR(120) NOT NULL,
    source VARCHAR(300) NOT NULL,
    destination VARCHAR(300) NOT NULL,
    readonly BOOL NOT NULL DEFAULT 0,
    mounted BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS plugins_plugins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plugin_name VARCHAR(120) NOT NULL,
    plugin_pbiname VARCHAR(120) NOT NULL DEFAULT '',
    plugin_version VARCHAR(120) NOT NULL DEFAULT '',
    plugin_enabled BOOL NOT NULL DEFAULT 0,
    plugin_ip VARCHAR(120) NOT NULL DEFAULT '',
    plugin_port INTEGER NOT NULL DEFAULT 0,
    plugin_path VARCHAR(1024) NOT NULL DEFAULT '',
    plugin_jail VARCHAR(120) NOT NULL
);

CREATE TABLE IF NOT EXISTS directoryservice_activedirectory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ad_enable BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS directoryservice_ldap (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ldap_enable BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS directoryservice_nis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nis_enable BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS directoryservice_nt4 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nt4_enable BOOL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS system_advanced (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    adv_cachesize_mb INTEGER NOT NULL DEFAULT 0
);
"#;
