use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// nasrc with its state redirected into `dir`
fn nasrc(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("nasrc").unwrap();
    cmd.env("NASRC_CONFIG", dir.path().join("absent.toml"))
        .env("NASRC_LOCK_DIR", dir.path().join("locks"))
        .env("NASRC_DATABASE", dir.path().join("nas.db"))
        .env_remove("NASRC_LOG_LEVEL")
        .env_remove("NASRC_LOG_FORMAT")
        .env_remove("RUST_LOG");
    cmd
}

fn init_db(dir: &TempDir) {
    nasrc(dir).args(["db", "init"]).assert().success();
}

fn seed(dir: &TempDir, sql: &str) {
    let conn = rusqlite::Connection::open(dir.path().join("nas.db")).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("nasrc.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("nasrc").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nasrc 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("nasrc").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout-wait"))
        .stdout(predicate::str::contains("jail"));
}

#[test]
fn test_timeout_wait_success() {
    let dir = tempfile::tempdir().unwrap();
    nasrc(&dir)
        .args(["timeout-wait", "5", "--", "true"])
        .assert()
        .success();
    // The lock file is gone afterwards
    let locks = dir.path().join("locks");
    assert_eq!(std::fs::read_dir(locks).unwrap().count(), 0);
}

#[test]
fn test_timeout_wait_command_failure() {
    let dir = tempfile::tempdir().unwrap();
    nasrc(&dir)
        .args(["timeout-wait", "5", "--", "sh", "-c", "exit 3"])
        .assert()
        .code(1);
}

#[test]
fn test_timeout_wait_kills_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let started = std::time::Instant::now();
    nasrc(&dir)
        .args(["timeout-wait", "1", "--", "sleep", "30"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("timed out"));
    assert!(started.elapsed() < std::time::Duration::from_secs(15));
}

#[test]
fn test_timeout_wait_requires_command() {
    let dir = tempfile::tempdir().unwrap();
    nasrc(&dir)
        .args(["timeout-wait", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "required arguments were not provided",
        ));
}

#[test]
fn test_db_get_set() {
    let dir = tempfile::tempdir().unwrap();
    init_db(&dir);
    seed(
        &dir,
        "INSERT INTO system_advanced (id, adv_cachesize_mb) VALUES (1, 64);",
    );

    nasrc(&dir)
        .args(["db", "get", "system_advanced", "adv_cachesize_mb", "1"])
        .assert()
        .success()
        .stdout("64\n");

    nasrc(&dir)
        .args(["db", "set", "system_advanced", "adv_cachesize_mb", "1", "512"])
        .assert()
        .success();

    nasrc(&dir)
        .args(["db", "get", "system_advanced", "adv_cachesize_mb", "1"])
        .assert()
        .success()
        .stdout("512\n");

    // Missing row
    nasrc(&dir)
        .args(["db", "get", "system_advanced", "adv_cachesize_mb", "9"])
        .assert()
        .code(1)
        .stdout("");
}

#[test]
fn test_db_missing_database() {
    let dir = tempfile::tempdir().unwrap();
    nasrc(&dir)
        .args(["db", "get", "system_advanced", "adv_cachesize_mb", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open configuration database"));
}

#[test]
fn test_service_status_and_enable() {
    let dir = tempfile::tempdir().unwrap();
    init_db(&dir);
    seed(
        &dir,
        "INSERT INTO services_services (srv_service, srv_enable) VALUES ('ssh', 0);",
    );

    nasrc(&dir)
        .args(["service", "status", "ssh"])
        .assert()
        .code(1)
        .stdout("ssh is disabled\n");

    nasrc(&dir)
        .args(["service", "enable", "ssh"])
        .assert()
        .success();

    nasrc(&dir)
        .args(["service", "status", "ssh"])
        .assert()
        .success()
        .stdout("ssh is enabled\n");

    nasrc(&dir)
        .args(["service", "enable", "nonesuch"])
        .assert()
        .failure();
}

#[test]
fn test_dirsrv_enable_writes_nsswitch() {
    let dir = tempfile::tempdir().unwrap();
    init_db(&dir);
    seed(
        &dir,
        "INSERT INTO directoryservice_nis (nis_enable) VALUES (1);",
    );
    let nsswitch = dir.path().join("nsswitch.conf");
    let config = write_config(
        &dir,
        &format!("[dirsrv]\nnsswitch_path = {:?}\n", nsswitch.to_str().unwrap()),
    );

    nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .args(["dirsrv", "enable"])
        .assert()
        .success();

    let text = std::fs::read_to_string(&nsswitch).unwrap();
    assert!(text.contains("passwd: files nis\n"));
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&nsswitch).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .args(["dirsrv", "status"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"nis\s+enabled").unwrap());
}

#[test]
fn test_jail_list_json_from_warden() {
    let dir = tempfile::tempdir().unwrap();
    init_db(&dir);
    let warden = dir.path().join("warden");
    write_script(
        &warden,
        r#"cat <<EOF
JAIL            AUTOSTART    STATUS    TYPE
-------------------------------------------------------
plex            Enabled      Running   pluginjail
EOF
"#,
    );
    let config = write_config(
        &dir,
        &format!("[paths]\nwarden = {:?}\n", warden.to_str().unwrap()),
    );

    let out = nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .args(["jail", "list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let jails: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(jails[0]["name"], "plex");
    assert_eq!(jails[0]["running"], true);
    assert_eq!(jails[0]["autostart"], true);
}

#[test]
fn test_build_stops_at_failing_stage() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran-release");
    let config = write_config(
        &dir,
        &format!(
            r#"
[pipeline]
workdir = {workdir:?}

[[pipeline.stages]]
name = "checkout"
command = ["true"]

[[pipeline.stages]]
name = "packages"
command = ["false"]

[[pipeline.stages]]
name = "release"
command = ["touch", {marker:?}]
"#,
            workdir = dir.path().to_str().unwrap(),
            marker = marker.to_str().unwrap(),
        ),
    );

    nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .arg("build")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("packages: exited with status 1"));
    assert!(!marker.exists());

    nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .args(["build", "--from", "release"])
        .assert()
        .success();
    assert!(marker.exists());

    nasrc(&dir)
        .arg("--config")
        .arg(&config)
        .args(["build", "--from", "deploy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stage 'deploy'"));
}

#[test]
fn test_sigterm_stops_plugin_batch() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    init_db(&dir);
    seed(
        &dir,
        "INSERT INTO plugins_plugins (plugin_name, plugin_enabled, plugin_jail) \
         VALUES ('first', 1, 'plex'), ('second', 1, 'plex'), ('third', 1, 'plex');",
    );
    let log = dir.path().join("jexec.log");
    let jexec = dir.path().join("jexec");
    write_script(
        &jexec,
        &format!(
            "echo \"start $3\" >> '{log}'\nsleep 3\necho \"done $3\" >> '{log}'\n",
            log = log.display()
        ),
    );
    let config = write_config(
        &dir,
        &format!("[paths]\njexec = {:?}\n", jexec.to_str().unwrap()),
    );

    let mut child = std::process::Command::cargo_bin("nasrc")
        .unwrap()
        .env("NASRC_CONFIG", &config)
        .env("NASRC_LOCK_DIR", dir.path().join("locks"))
        .env("NASRC_DATABASE", dir.path().join("nas.db"))
        .env_remove("RUST_LOG")
        .args(["plugins", "start", "plex"])
        .spawn()
        .unwrap();

    let read_log = || std::fs::read_to_string(&log).unwrap_or_default();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !read_log().contains("start first") {
        assert!(Instant::now() < deadline, "first plugin never started");
        std::thread::sleep(Duration::from_millis(50));
    }

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("nasrc still running after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(status.code(), Some(130));

    // Neither the rest of the batch nor the interrupted plugin's tail ran
    std::thread::sleep(Duration::from_secs(3));
    let text = read_log();
    assert!(!text.contains("start second"), "{}", text);
    assert!(!text.contains("done first"), "{}", text);
}
