//! CLI integration tests
//!
//! Tests the tunmux CLI using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn tunmux() -> Command {
    Command::cargo_bin("tunmux")
        .expect("Failed to locate tunmux binary - ensure it's built before running tests")
}

#[test]
fn test_cli_help() {
    tunmux()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("tunmux"))
        .stdout(predicate::str::contains("Multiplexed websocket tunnels"));
}

#[test]
fn test_cli_version() {
    tunmux()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tunmux"));
}

#[test]
fn test_cli_dial_help() {
    tunmux()
        .args(["dial", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failover"))
        .stdout(predicate::str::contains("--keep"));
}

#[test]
fn test_cli_serve_help() {
    tunmux()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn test_cli_invalid_command() {
    tunmux().arg("tunnel-everything").assert().failure();
}

#[test]
fn test_config_init_show_get_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunmux.toml");
    let path_arg = path.to_str().unwrap();

    tunmux()
        .args(["--config", path_arg, "config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));
    assert!(path.exists());

    tunmux()
        .args(["--config", path_arg, "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[yamux]"));

    tunmux()
        .args(["--config", path_arg, "config", "set", "protocol", "yamux"])
        .assert()
        .success();

    tunmux()
        .args(["--config", path_arg, "config", "get", "protocol"])
        .assert()
        .success()
        .stdout(predicate::str::contains("yamux"));
}

#[test]
fn test_config_init_refuses_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunmux.toml");
    std::fs::write(&path, "protocol = \"yamux\"\n").unwrap();

    tunmux()
        .args(["--config", path.to_str().unwrap(), "config", "init"])
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "protocol = \"yamux\"\n");
}

#[test]
fn test_config_path_honours_flag() {
    tunmux()
        .args(["--config", "/tmp/elsewhere.toml", "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/elsewhere.toml"));
}

#[test]
fn test_dial_without_candidates_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunmux.toml");
    std::fs::write(&path, "addresses = []\n").unwrap();

    tunmux()
        .args(["--config", path.to_str().unwrap(), "dial"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no usable tunnel address"));
}
