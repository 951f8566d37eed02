use assert_cmd::Command;
use predicates::str::contains;
use std::fs;

fn sample_manifest() -> serde_json::Value {
    serde_json::json!({
        "repository": {
            "url": "https://github.com/acme/widgets",
            "default_branch": "main",
            "commit_sha": "deadbeef",
            "analysis_timestamp": "2025-01-01T00:00:00Z"
        },
        "files": [
            {
                "path": "src/app.py",
                "blob_id": "b1",
                "size": 2048,
                "extension": ".py",
                "category": "authentication",
                "security_relevance": "high",
                "vulnerabilities": [],
                "risk_assessment": {
                    "risk_score": 6.0,
                    "priority": "HIGH",
                    "sla_hours": 24,
                    "components": {},
                    "reasoning": "no scanner findings; high-impact authentication file"
                }
            }
        ]
    })
}

#[test]
fn show_renders_manifest_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    fs::write(&path, serde_json::to_vec_pretty(&sample_manifest()).unwrap()).unwrap();

    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args(["show", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("Repository: https://github.com/acme/widgets"))
        .stdout(contains("Commit: deadbeef"))
        .stdout(contains("src/app.py"))
        .stdout(contains("HIGH: 1 files"));
}

#[test]
fn show_missing_manifest_fails() {
    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args(["show", "/nonexistent/manifest.json"])
        .assert()
        .failure()
        .stderr(contains("manifest not found"));
}

#[test]
fn corrupt_manifest_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    fs::write(&path, "{ not json").unwrap();

    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args(["show", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("not valid JSON"));
}

#[test]
fn invalid_risk_weights_exit_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("sentinel.yaml");
    fs::write(
        &config_path,
        "risk_scoring:\n  weights:\n    vulnerability_severity: 0.9\n    file_category: 0.9\n    security_relevance: 0.9\n",
    )
    .unwrap();

    let manifest_path = dir.path().join("manifest.json");
    fs::write(
        &manifest_path,
        serde_json::to_vec_pretty(&sample_manifest()).unwrap(),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args([
        "--config",
        config_path.to_str().unwrap(),
        "show",
        manifest_path.to_str().unwrap(),
    ])
    .assert()
    .code(2)
    .stderr(contains("weights must sum to 1.0"));
}

#[test]
fn unknown_phase_is_rejected_before_any_network_access() {
    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args([
        "analyze",
        "https://github.com/acme/widgets",
        "--phase",
        "7",
    ])
    .assert()
    .code(2)
    .stderr(contains("unknown phase"));
}

#[test]
fn analyze_tokens_writes_sibling_report_for_empty_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let empty = serde_json::json!({
        "repository": {
            "url": "https://github.com/acme/widgets",
            "default_branch": "main",
            "commit_sha": "deadbeef",
            "analysis_timestamp": "2025-01-01T00:00:00Z"
        },
        "files": []
    });
    fs::write(&path, serde_json::to_vec_pretty(&empty).unwrap()).unwrap();

    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.args(["analyze-tokens", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("Token analysis for 0 files"));

    let report = dir.path().join("manifest.tokens.json");
    let value: serde_json::Value =
        serde_json::from_slice(&fs::read(report).unwrap()).unwrap();
    assert_eq!(value["repository_stats"]["analyzed_files"], 0);
    assert_eq!(value["pricing_info"]["currency"], "USD");
}

#[test]
fn help_lists_every_verb() {
    let mut cmd = Command::cargo_bin("repo-sentinel").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("analyze"))
        .stdout(contains("show"))
        .stdout(contains("test-connection"))
        .stdout(contains("test-llm"))
        .stdout(contains("test-vulnerability-scanner"))
        .stdout(contains("cost-preview"))
        .stdout(contains("analyze-tokens"));
}
