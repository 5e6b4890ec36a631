//! CLI Integration Tests
//!
//! These tests cover the parts of the binary that do not need a network.

use assert_cmd::Command;
use polycode_core::topic_hex;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli_cmd() -> Command {
    Command::cargo_bin("polycode").expect("Failed to find polycode binary")
}

#[test]
fn test_topic_default_name() {
    cli_cmd()
        .arg("topic")
        .assert()
        .success()
        .stdout(format!("{}\n", topic_hex("polycode")));
}

#[test]
fn test_topic_custom_name() {
    cli_cmd()
        .args(["topic", "--topic", "ab"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("61626162"))
        .stdout(predicate::str::contains(topic_hex("ab")));
}

#[test]
fn test_help_lists_commands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("topic"));
}

#[test]
fn test_serve_help_lists_flags() {
    cli_cmd()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workspace"))
        .stdout(predicate::str::contains("--bootstrap"))
        .stdout(predicate::str::contains("--log-dir"));
}

#[test]
fn test_serve_rejects_missing_workspace() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("does-not-exist");

    cli_cmd()
        .args(["serve", "--workspace"])
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not accessible"));
}

#[test]
fn test_serve_rejects_bad_config_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("polycode.json");
    std::fs::write(&config, "{ not json").unwrap();

    cli_cmd()
        .args(["serve", "--config"])
        .arg(&config)
        .args(["--workspace"])
        .arg(temp.path())
        .assert()
        .failure();
}
