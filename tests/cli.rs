//! Integration tests for the warden CLI.
//!
//! These run the real binary. Nothing here needs a container runtime:
//! commands that would start a pool are only exercised up to argument and
//! configuration handling.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the warden binary.
#[allow(deprecated)]
fn warden() -> Command {
    let mut cmd = Command::cargo_bin("warden").expect("failed to find warden binary");
    cmd.env_remove("WARDEN_CONFIG");
    cmd
}

/// Creates a Command for warden running in a specific directory.
fn warden_in(dir: &TempDir) -> Command {
    let mut cmd = warden();
    cmd.current_dir(dir.path());
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join("warden.toml"), content).unwrap();
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    warden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("warden"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn test_version_shows_version() {
    warden()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warden"));
}

#[test]
fn test_run_help_shows_all_options() {
    warden()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--session"))
        .stdout(predicate::str::contains("--env"))
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("--grace"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_global_flags_listed() {
    warden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--verbose"))
        .stdout(predicate::str::contains("--log-format"));
}

// -----------------------------------------------------------------------------
// check
// -----------------------------------------------------------------------------

#[test]
fn test_check_without_config_uses_defaults() {
    let dir = TempDir::new().unwrap();
    warden_in(&dir)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("using defaults"))
        .stdout(predicate::str::contains("warden-agent:latest"))
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_check_reads_config_file() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
name = "reviewers"
image = "registry.local/reviewer:2"
pool_size = 3

[admission]
rate_limit_per_minute = 30
max_pending = 2
"#,
    );

    warden_in(&dir)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("reviewers"))
        .stdout(predicate::str::contains("registry.local/reviewer:2"))
        .stdout(predicate::str::contains("30/min"));
}

#[test]
fn test_check_with_explicit_config_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool.toml");
    fs::write(&path, "name = \"custom\"\n").unwrap();

    warden()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom"));
}

#[test]
fn test_check_rejects_contradictory_config() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[resources]
pids_limit = 4

[admission]
max_pending = 8
"#,
    );

    warden_in(&dir)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_pending"));
}

#[test]
fn test_check_rejects_read_only_root_without_scratch() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[security]
read_only_rootfs = true
tmpfs = {}
"#,
    );

    warden_in(&dir)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("tmpfs"));
}

#[test]
fn test_check_rejects_malformed_toml() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "pool_size = \"many\"\n");

    warden_in(&dir)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_check_rejects_bad_duration() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "task_timeout = \"soon\"\n");

    warden_in(&dir).arg("check").assert().failure();
}

// -----------------------------------------------------------------------------
// run argument handling
// -----------------------------------------------------------------------------

#[test]
fn test_run_requires_prompt() {
    warden().arg("run").assert().failure();
}

#[test]
fn test_run_rejects_malformed_env() {
    warden()
        .args(["run", "do it", "--env", "NOVALUE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

#[test]
fn test_run_rejects_bad_timeout() {
    warden()
        .args(["run", "do it", "--timeout", "whenever"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid duration"));
}

#[test]
fn test_unknown_log_format_rejected() {
    warden()
        .args(["--log-format", "xml", "check"])
        .assert()
        .failure();
}
