//! Integration tests for `harborctl host` inventory management against a
//! throwaway config file and state dir.

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn cmd(config: &std::path::Path, state_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("harborctl").unwrap();
    cmd.arg("--config").arg(config).arg("--state-dir").arg(state_dir);
    cmd
}

#[test]
fn add_list_and_remove_round_trips() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("hosts.yml");
    let state_dir = dir.path().join("state");

    cmd(&config, &state_dir)
        .args([
            "host",
            "add",
            "prod-1",
            "prod1.example.com",
            "--compose-path",
            "/srv/compose",
            "--appdata-path",
            "/srv/appdata",
        ])
        .assert()
        .success();

    let output = cmd(&config, &state_dir).args(["host", "list"]).assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    let hosts: Value = serde_json::from_str(&stdout).expect("host list should print JSON");
    let hosts = hosts.as_array().unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0]["host_id"], "prod-1");
    assert_eq!(hosts[0]["hostname"], "prod1.example.com");

    // Adding the same host_id again is rejected.
    cmd(&config, &state_dir)
        .args([
            "host",
            "add",
            "prod-1",
            "prod1.example.com",
            "--compose-path",
            "/srv/compose",
            "--appdata-path",
            "/srv/appdata",
        ])
        .assert()
        .failure();

    cmd(&config, &state_dir)
        .args(["host", "remove", "prod-1"])
        .assert()
        .success();

    let output = cmd(&config, &state_dir).args(["host", "list"]).assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    let hosts: Value = serde_json::from_str(&stdout).unwrap();
    assert!(hosts.as_array().unwrap().is_empty());
}

#[test]
fn rejects_malformed_host_id() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("hosts.yml");
    let state_dir = dir.path().join("state");

    cmd(&config, &state_dir)
        .args([
            "host",
            "add",
            "Not Valid!",
            "host.example.com",
            "--compose-path",
            "/srv/compose",
            "--appdata-path",
            "/srv/appdata",
        ])
        .assert()
        .failure();
}
