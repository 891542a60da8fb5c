//! Integration tests for the databind CLI
//!
//! These tests run the actual binary and verify output.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get the binary to test
fn databind_cmd() -> Command {
    Command::cargo_bin("databind").unwrap()
}

#[test]
fn test_help_flag() {
    databind_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("data-binding engine"))
        .stdout(predicate::str::contains("eval"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_eval_help() {
    databind_cmd()
        .args(["eval", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--data"))
        .stdout(predicate::str::contains("--set"));
}

// ============================================================================
// eval
// ============================================================================

#[test]
fn test_eval_literal_expression() {
    databind_cmd()
        .args(["eval", "1 + 2 * 3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("7"));
}

#[test]
fn test_eval_reads_document() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("plant.json");
    fs::write(&data_file, r#"{"motor": {"speed": 21}}"#).unwrap();

    databind_cmd()
        .args(["eval", "data.motor.speed * 2", "--data"])
        .arg(&data_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn test_eval_with_named_model_and_lookup() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("plant.json");
    fs::write(&data_file, r#"{"regs": [10, 20, 30]}"#).unwrap();

    databind_cmd()
        .args(["eval", "plant.regs[2]", "-m", "plant", "-d"])
        .arg(&data_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("30"));
}

#[test]
fn test_eval_set_writes_before_reading() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("plant.json");
    fs::write(&data_file, r#"{"motor": {}}"#).unwrap();

    databind_cmd()
        .args(["eval", "motor.speed + 1", "--set", "motor.speed=5", "--data"])
        .arg(&data_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("6"))
        .stderr(predicate::str::contains("Document:"));
}

#[test]
fn test_eval_syntax_error() {
    databind_cmd()
        .args(["eval", "1 +"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_eval_missing_data_file() {
    databind_cmd()
        .args(["eval", "data.x", "--data", "/nonexistent/plant.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_eval_bad_assignment() {
    databind_cmd()
        .args(["eval", "1", "--set", "no-equals-sign"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NAME=VALUE"));
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_valid_binding_file() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("index.json"),
        r#"{"widgetBindings": [
            {"widgetId": "gauge", "propertyName": "value", "serverBindName": "plant.speed * 2"},
            {"widgetId": "label", "propertyName": "text", "serverBindName": "plant.on ? 1 : 0"}
        ]}"#,
    )
    .unwrap();

    databind_cmd()
        .arg("check")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("✓"))
        .stdout(predicate::str::contains("Files: 1"));
}

#[test]
fn test_check_yaml_binding_file() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("panel.yaml");
    fs::write(
        &file,
        r#"
widgetBindings:
  - widgetId: gauge
    propertyName: value
    serverBindName: plant.speed.$hex
"#,
    )
    .unwrap();

    databind_cmd()
        .arg("check")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓"));
}

#[test]
fn test_check_invalid_expression() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("good.json"),
        r#"{"widgetBindings": [{"widgetId": "a", "propertyName": "b", "serverBindName": "x.y"}]}"#,
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("bad.json"),
        r#"{"widgetBindings": [{"widgetId": "a", "propertyName": "b", "serverBindName": "x.y +"}]}"#,
    )
    .unwrap();

    databind_cmd()
        .arg("check")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("✗"))
        .stdout(predicate::str::contains("x.y +"))
        .stdout(predicate::str::contains("Files: 2"))
        .stderr(predicate::str::contains("1 of 2 binding files are invalid"));
}

#[test]
fn test_check_malformed_file() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("broken.json");
    fs::write(&file, "{ not json").unwrap();

    databind_cmd()
        .arg("check")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("✗"));
}

#[test]
fn test_check_missing_path() {
    databind_cmd()
        .args(["check", "/nonexistent/bindings"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
