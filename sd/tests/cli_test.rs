//! CLI smoke tests
//!
//! These run the real binary with HOME/XDG dirs pointed at a temp dir so
//! nothing leaks into the invoking environment.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;

fn sd(temp: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sd").unwrap();
    cmd.env("HOME", temp)
        .env("XDG_DATA_HOME", temp.join("data"))
        .env("XDG_CONFIG_HOME", temp.join("config"));
    cmd
}

#[test]
#[serial]
fn test_help() {
    let temp = tempfile::tempdir().unwrap();
    sd(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cycled-list orchestrator"));
}

#[test]
#[serial]
fn test_daemon_status_when_not_running() {
    let temp = tempfile::tempdir().unwrap();
    sd(temp.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
#[serial]
fn test_jobs_list_shows_catalogue() {
    let temp = tempfile::tempdir().unwrap();
    sd(temp.path())
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sync_eod_prices"))
        .stdout(predicate::str::contains("sync_fundamentals"));
}

#[test]
#[serial]
fn test_prune_requires_confirmation() {
    let temp = tempfile::tempdir().unwrap();
    sd(temp.path())
        .args(["records", "prune"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
#[serial]
fn test_list_status_fails_without_daemon() {
    let temp = tempfile::tempdir().unwrap();
    sd(temp.path()).args(["list", "status"]).assert().failure();
}
