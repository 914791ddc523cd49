use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn relay(tmp: &Path) -> Command {
    let mut cmd = Command::cargo_bin("metered-relay").unwrap();
    cmd.arg("--config")
        .arg(tmp.join("absent.toml"))
        .env("METERED_RELAY_QUEUE_DIR", tmp.join("queue"))
        .env_remove("METERED_RELAY_CELLULAR_LIMIT_MB")
        .env_remove("METERED_RELAY_STORAGE_LIMIT_MB")
        .env_remove("METERED_RELAY_PLAN_DATE")
        .env_remove("RUST_LOG");
    cmd
}

fn queued(tmp: &Path) -> usize {
    fs::read_dir(tmp.join("queue")).unwrap().count()
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("metered-relay").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("metered-relay 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("metered-relay").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Relay telemetry within a metered-data budget",
        ));
}

#[test]
fn test_cli_unmetered_relays_everything() {
    let tmp = TempDir::new().unwrap();
    relay(tmp.path())
        .write_stdin(
            "{\"topic\":\"event\",\"data\":{\"signal\":6}}\n{\"topic\":\"log\",\"data\":\"x\"}\n",
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("\"channel\":\"events\""))
        .stdout(predicate::str::contains("\"channel\":\"logs\""));
    assert_eq!(queued(tmp.path()), 0);
}

#[test]
fn test_cli_over_budget_queues_then_replays() {
    let tmp = TempDir::new().unwrap();

    relay(tmp.path())
        .env("METERED_RELAY_CELLULAR_LIMIT_MB", "0")
        .write_stdin("{\"topic\":\"profile\",\"data\":[1,2,3]}\n")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    assert_eq!(queued(tmp.path()), 1);

    relay(tmp.path())
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"channel\":\"profiler\""));
    assert_eq!(queued(tmp.path()), 0);
}

#[test]
fn test_cli_invalid_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("relay.toml");
    fs::write(&config, "[cellular]\nplan_date = 31\n").unwrap();

    let mut cmd = Command::cargo_bin("metered-relay").unwrap();
    cmd.arg("--config")
        .arg(&config)
        .env_remove("METERED_RELAY_PLAN_DATE")
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid plan date"));
}
