//! CLI integration tests for the `policyline` subcommands.
//!
//! Uses `assert_cmd` to spawn the binary and verify exit codes, stdout
//! content, and stderr content. Every test runs inside its own temporary
//! directory so no stray `policyline.toml` is picked up.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper: create a Command for the `policyline` binary, rooted at `dir`.
fn policyline(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("policyline");
    cmd.current_dir(dir)
        .env_remove("POLICYLINE_CONFIG")
        .env_remove("POLICYLINE_PORT")
        .env("POLICYLINE_LOG", "warn");
    cmd
}

fn write_json(dir: &Path, name: &str, value: serde_json::Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

fn base_rules(dir: &Path) -> PathBuf {
    write_json(
        dir,
        "base.json",
        serde_json::json!([
            {"id": 1, "ruleName": "R1", "priority": 10,
             "emissions": [{"subtaskTypeId": 10, "relationshipType": "blocks"}]},
            {"id": 2, "ruleName": "R3", "priority": 5}
        ]),
    )
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Policy snapshot evolution and canary deployment",
        ));
}

#[test]
fn version_exits_0() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("policyline"));
}

#[test]
fn unknown_subcommand_fails() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path()).arg("deploy-everything").assert().failure();
}

// ──────────────────────────────────────────────
// 2. Ladder
// ──────────────────────────────────────────────

#[test]
fn ladder_prints_every_rung() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .arg("ladder")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 -> 5 -> 25 -> 50 -> 100"));
}

#[test]
fn ladder_steps_from_a_percent() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .args(["ladder", "25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("25 -> 50"));
    policyline(tmp.path())
        .args(["ladder", "100", "--output", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""next":100"#));
}

#[test]
fn ladder_rejects_percent_above_100() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .args(["ladder", "120"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("between 0 and 100"));
}

// ──────────────────────────────────────────────
// 3. Build
// ──────────────────────────────────────────────

#[test]
fn build_prints_text_diff() {
    let tmp = TempDir::new().unwrap();
    let base = base_rules(tmp.path());
    let proposal = write_json(
        tmp.path(),
        "proposal.json",
        serde_json::json!({
            "baseSnapshotId": 1,
            "newVersion": "v2",
            "changes": [
                {"action": "CREATE", "ruleData": {"ruleName": "R2", "priority": 3}},
                {"action": "MODIFY", "ruleId": 1, "ruleData": {"priority": 20}},
                {"action": "DELETE", "ruleId": 2}
            ]
        }),
    );
    policyline(tmp.path())
        .arg("build")
        .arg(&proposal)
        .arg("--base")
        .arg(&base)
        .assert()
        .success()
        .stdout(predicate::str::contains("built v2 (2 rules"))
        .stdout(predicate::str::contains("+ R2"))
        .stdout(predicate::str::contains("- R3"))
        .stdout(predicate::str::contains("~ R1"));
}

#[test]
fn build_json_carries_draft_rules() {
    let tmp = TempDir::new().unwrap();
    let base = base_rules(tmp.path());
    let proposal = write_json(
        tmp.path(),
        "proposal.json",
        serde_json::json!({
            "baseSnapshotId": 1,
            "newVersion": "v2",
            "changes": [{"action": "MODIFY", "ruleId": 1, "ruleData": {"priority": 20}}]
        }),
    );
    let output = policyline(tmp.path())
        .arg("build")
        .arg(&proposal)
        .arg("--base")
        .arg(&base)
        .args(["--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["snapshot"]["version"], "v2");
    assert_eq!(doc["snapshot"]["artifactFormat"], "native");
    assert_eq!(doc["snapshot"]["parentId"], 1);
    assert_eq!(doc["diff"]["modified"], serde_json::json!(["R1"]));
    let r1 = doc["rules"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["ruleName"] == "R1")
        .unwrap();
    assert_eq!(r1["priority"], 20);
    assert_eq!(r1["emissions"][0]["subtaskTypeId"], 10);
}

#[test]
fn build_ignores_absent_targets_by_default() {
    let tmp = TempDir::new().unwrap();
    let base = base_rules(tmp.path());
    let proposal = write_json(
        tmp.path(),
        "proposal.json",
        serde_json::json!({
            "baseSnapshotId": 1,
            "newVersion": "v2",
            "changes": [{"action": "DELETE", "ruleId": 99}]
        }),
    );
    policyline(tmp.path())
        .arg("build")
        .arg(&proposal)
        .arg("--base")
        .arg(&base)
        .assert()
        .success()
        .stdout(predicate::str::contains("change 0 skipped"));

    policyline(tmp.path())
        .arg("build")
        .arg(&proposal)
        .arg("--base")
        .arg(&base)
        .arg("--reject-missing")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the base rule set"));
}

#[test]
fn build_reports_unreadable_proposal() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .args(["build", "missing.json", "--output", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(r#""error""#));
}

// ──────────────────────────────────────────────
// 4. Validate
// ──────────────────────────────────────────────

#[test]
fn validate_passes_clean_rules() {
    let tmp = TempDir::new().unwrap();
    let rules = base_rules(tmp.path());
    policyline(tmp.path())
        .arg("validate")
        .arg(&rules)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid (2 rules)"));
}

#[test]
fn validate_flags_negative_priority() {
    let tmp = TempDir::new().unwrap();
    let rules = write_json(
        tmp.path(),
        "rules.json",
        serde_json::json!([
            {"ruleName": "R1", "priority": 10},
            {"ruleName": "R2", "priority": -1}
        ]),
    );
    policyline(tmp.path())
        .arg("validate")
        .arg(&rules)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Rule R2 has invalid priority"));
}

#[test]
fn validate_strict_adds_checks() {
    let tmp = TempDir::new().unwrap();
    let rules = write_json(
        tmp.path(),
        "rules.json",
        serde_json::json!([{"ruleName": "R1", "priority": 1}]),
    );
    policyline(tmp.path()).arg("validate").arg(&rules).assert().success();
    policyline(tmp.path())
        .arg("validate")
        .arg(&rules)
        .arg("--strict")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Rule R1 has no emissions"));
}

// ──────────────────────────────────────────────
// 5. Evolve
// ──────────────────────────────────────────────

#[test]
fn evolve_runs_from_seed_to_canary() {
    let tmp = TempDir::new().unwrap();
    let seed = write_json(
        tmp.path(),
        "seed.json",
        serde_json::json!({"snapshots": [
            {"version": "v1", "rules": [{"ruleName": "R1", "priority": 10}]}
        ]}),
    );
    let proposal = write_json(
        tmp.path(),
        "proposal.json",
        serde_json::json!({
            "baseSnapshotId": 1,
            "newVersion": "v2",
            "reason": "add billing rule",
            "changes": [{"action": "CREATE", "ruleData": {"ruleName": "R2", "priority": 4}}]
        }),
    );
    let output = policyline(tmp.path())
        .arg("evolve")
        .arg("--seed")
        .arg(&seed)
        .arg("--proposal")
        .arg(&proposal)
        .args(["--steps", "3", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["stage"], "deploying");
    assert_eq!(doc["percent"], 50);
    assert_eq!(doc["snapshot"]["version"], "v2");
    assert_eq!(doc["snapshot"]["artifactFormat"], "wasm");
    assert_eq!(doc["events"].as_array().unwrap().len(), 3);
    assert_eq!(doc["diff"]["added"], serde_json::json!(["R2"]));
}

#[test]
fn evolve_refuses_deploy_after_failed_validation() {
    let tmp = TempDir::new().unwrap();
    let proposal = write_json(
        tmp.path(),
        "proposal.json",
        serde_json::json!({
            "newVersion": "v1",
            "changes": [{"action": "CREATE", "ruleData": {"ruleName": "R2", "priority": -1}}]
        }),
    );
    policyline(tmp.path())
        .arg("evolve")
        .arg("--proposal")
        .arg(&proposal)
        .assert()
        .failure()
        .stderr(predicate::str::contains("deploy refused"))
        .stderr(predicate::str::contains("Rule R2 has invalid priority"));
}

#[test]
fn evolve_rejects_malformed_lane() {
    let tmp = TempDir::new().unwrap();
    let proposal = write_json(tmp.path(), "proposal.json", serde_json::json!({"newVersion": "v1"}));
    policyline(tmp.path())
        .arg("evolve")
        .arg("--proposal")
        .arg(&proposal)
        .args(["--lane", "router"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("target/region"));
}

// ──────────────────────────────────────────────
// 6. Config
// ──────────────────────────────────────────────

#[test]
fn config_defaults_without_file() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 8080"))
        .stdout(predicate::str::contains("max_lane_retries = 3"));
}

#[test]
fn config_file_in_working_directory_is_used() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("policyline.toml"), "[server]\nport = 9311\n").unwrap();
    policyline(tmp.path())
        .args(["config", "--output", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""port":9311"#));
}

#[test]
fn config_environment_overrides_port() {
    let tmp = TempDir::new().unwrap();
    policyline(tmp.path())
        .arg("config")
        .env("POLICYLINE_PORT", "9400")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 9400"));
}

#[test]
fn invalid_config_lists_every_problem() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.toml");
    fs::write(&path, "[server]\nport = 0\n[pipeline]\nenv = \"\"\n").unwrap();
    policyline(tmp.path())
        .arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("server.port"))
        .stderr(predicate::str::contains("pipeline.env"));
}

#[test]
fn unparseable_config_fails() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.toml");
    fs::write(&path, "[server\nport = 1\n").unwrap();
    policyline(tmp.path())
        .arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not parse"));
}
