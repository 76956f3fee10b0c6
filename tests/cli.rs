// ABOUTME: Integration tests for the shipwright CLI commands.
// ABOUTME: Validates --help output, init, and the state commands that need no host.

use assert_cmd::Command;
use predicates::prelude::*;
use shipwright::deploy::{DeploymentState, FileStateStore, StateStore};
use shipwright::types::RunId;
use std::fs;
use std::path::Path;

fn shipwright_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("shipwright"))
}

fn initialized_project() -> tempfile::TempDir {
    let temp_dir = tempfile::tempdir().unwrap();
    shipwright_cmd()
        .current_dir(temp_dir.path())
        .args(["init", "--project", "shop"])
        .assert()
        .success();
    temp_dir
}

fn save_run(project: &Path, id: &str) -> RunId {
    let run_id = RunId::new(id).unwrap();
    FileStateStore::new(project.join(".shipwright/runs"))
        .save(&DeploymentState::new(run_id.clone()))
        .unwrap();
    run_id
}

#[test]
fn help_shows_commands() {
    shipwright_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("purge"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn init_creates_config_file() {
    let temp_dir = initialized_project();
    let config_path = temp_dir.path().join("shipwright.yml");

    assert!(config_path.exists(), "shipwright.yml should be created");
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("project: shop"));
    assert!(content.contains("healthchecks:"));
}

#[test]
fn init_refuses_to_overwrite_existing_config() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(temp_dir.path().join("shipwright.yml"), "existing: config").unwrap();

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn dir_flag_selects_the_project() {
    let temp_dir = tempfile::tempdir().unwrap();

    shipwright_cmd()
        .arg("-C")
        .arg(temp_dir.path())
        .arg("init")
        .assert()
        .success();

    assert!(temp_dir.path().join("shipwright.yml").exists());
}

#[test]
fn status_without_config_fails() {
    let temp_dir = tempfile::tempdir().unwrap();

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn status_without_runs_fails() {
    let temp_dir = initialized_project();

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no previous run"));
}

#[test]
fn status_shows_latest_run() {
    let temp_dir = initialized_project();
    save_run(temp_dir.path(), "shop-20260101-120000");

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run shop-20260101-120000"));
}

#[test]
fn status_json_prints_state() {
    let temp_dir = initialized_project();
    save_run(temp_dir.path(), "shop-20260101-120000");

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .args(["--json", "status", "--run-id", "shop-20260101-120000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"run_id\":\"shop-20260101-120000\""));
}

#[test]
fn purge_removes_run_state() {
    let temp_dir = initialized_project();
    let run_id = save_run(temp_dir.path(), "shop-20260101-120000");
    let state_file = temp_dir
        .path()
        .join(".shipwright/runs")
        .join(format!("{}.json", run_id));
    assert!(state_file.exists());

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .args(["purge", "--run-id", "shop-20260101-120000"])
        .assert()
        .success();

    assert!(!state_file.exists());
}

#[test]
fn purge_unknown_run_fails() {
    let temp_dir = initialized_project();

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .args(["purge", "--run-id", "shop-20990101-000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn destroy_requires_confirmation() {
    let temp_dir = initialized_project();

    shipwright_cmd()
        .current_dir(temp_dir.path())
        .arg("destroy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn resume_conflicts_with_run_id() {
    shipwright_cmd()
        .args(["deploy", "--resume", "--run-id", "shop-20260101-120000"])
        .assert()
        .failure();
}
