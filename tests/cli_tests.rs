mod support;

use assert_cmd::Command;
use predicates::prelude::*;

fn apiflow(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("apiflow").unwrap();
    cmd.current_dir(dir).env_remove("APIFLOW_CONFIG");
    cmd
}

#[test]
fn help_lists_every_command() {
    let dir = tempfile::tempdir().unwrap();
    apiflow(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("optimize"))
        .stdout(predicate::str::contains("queue"))
        .stdout(predicate::str::contains("pipeline"));
}

#[test]
fn validate_accepts_well_formed_config() {
    let (dir, path) = support::write_temp_config("[queue]\nworkers = 2\n");
    apiflow(dir.path())
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Config file is valid"));
}

#[test]
fn validate_returns_nonzero_on_invalid_value() {
    let (dir, path) = support::write_temp_config("[queue]\nworkers = 0\n");
    let output = apiflow(dir.path())
        .args(["config", "validate", "--config"])
        .arg(&path)
        .output()
        .unwrap();

    assert!(!output.status.success(), "expected nonzero exit code");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid value for workers"),
        "expected a workers error, got: {stderr}"
    );
}

#[test]
fn config_show_emits_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let output = apiflow(dir.path())
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(lines.iter().any(|line| line["type"] == "section"));
    assert!(lines
        .iter()
        .any(|line| line["type"] == "field" && line["payload"]["label"] == "Workers"));
}

#[test]
fn queue_command_runs_synthetic_jobs() {
    let dir = tempfile::tempdir().unwrap();
    apiflow(dir.path())
        .args(["queue", "--jobs", "5", "--work-ms", "1", "--quiet"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

#[test]
fn optimize_dedup_demo_reports_tables_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = apiflow(dir.path())
        .args(["optimize", "--demo", "dedup", "--requests", "10", "--json"])
        .timeout(std::time::Duration::from_secs(30))
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let tables: Vec<serde_json::Value> = stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|line| line["type"] == "table")
        .collect();
    assert!(!tables.is_empty(), "expected at least one table in: {stdout}");
}

#[test]
fn pipeline_writes_processed_copy() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("notes.txt");
    std::fs::write(&input, "hello pipeline").unwrap();

    apiflow(dir.path())
        .args(["pipeline", "--uppercase", "--quiet"])
        .arg(&input)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    let written = std::fs::read_to_string(dir.path().join("notes.txt.processed")).unwrap();
    assert_eq!(written, "HELLO PIPELINE");
}
