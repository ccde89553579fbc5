use assert_cmd::Command;
use std::fs;
use tempfile::tempdir;

fn updown() -> Command {
    let mut cmd = Command::cargo_bin("updown").unwrap();
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn config_prints_effective_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");

    let output = updown()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .output()
        .unwrap();
    assert!(output.status.success());
    let cfg: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(cfg["violation_ceiling"], 7);
    assert!(!path.exists());
}

#[test]
fn write_default_creates_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    updown()
        .arg("--config")
        .arg(&path)
        .args(["config", "--write-default"])
        .assert()
        .success();
    let written: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(written["session_hours"], 10.0);
}

#[test]
fn simulate_reports_goal_achieved() {
    let output = updown()
        .args(["simulate", "--testing", "--seed", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["reason"], "goal_achieved");
    assert_eq!(report["state"], "finished");
    assert!(report["completed_secs"].as_u64().unwrap() >= report["goal_secs"].as_u64().unwrap());
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, "{ not json").unwrap();

    updown()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure();
}
