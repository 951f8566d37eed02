use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{check_min_version, normalize_severity, pip_install, VulnScanner};
use crate::config::ScannerSettings;
use crate::error::{Result, SentinelError};
use crate::manifest::Finding;

const MIN_VERSION: (u32, u32, u32) = (1, 0, 0);

/// Multi-language rule engine, invoked with its bundled `auto` config.
pub struct SemgrepScanner;

#[async_trait]
impl VulnScanner for SemgrepScanner {
    fn name(&self) -> &str {
        "semgrep"
    }

    async fn ensure_available(&self, auto_install: bool) -> Result<()> {
        match check_min_version("semgrep", "semgrep", &["--version"], MIN_VERSION).await {
            Ok(()) => Ok(()),
            Err(err) if auto_install => {
                pip_install("semgrep", "semgrep").await.map_err(|_| err)?;
                check_min_version("semgrep", "semgrep", &["--version"], MIN_VERSION).await
            }
            Err(err) => Err(err),
        }
    }

    // the runner sets the working directory to the scratch tree; scanning
    // `.` keeps reported paths repo-relative
    fn command(&self, _workdir: &Path, settings: &ScannerSettings) -> Command {
        let mut command = Command::new("semgrep");
        command
            .arg("scan")
            .args(["--config", "auto"])
            .arg("--json")
            .arg("--quiet")
            .arg("--disable-version-check");
        if let Some(severity) = &settings.severity_level {
            command.args(["--severity", severity]);
        }
        for pattern in &settings.exclude_patterns {
            command.args(["--exclude", pattern]);
        }
        command.arg(".");
        command
    }

    fn parse_findings(&self, stdout: &[u8]) -> Result<Vec<(String, Finding)>> {
        let report: SemgrepReport = serde_json::from_slice(stdout)
            .map_err(|err| SentinelError::MalformedResponse(format!("semgrep output: {err}")))?;

        Ok(report
            .results
            .into_iter()
            .map(|result| {
                let severity = result
                    .extra
                    .metadata
                    .as_ref()
                    .and_then(|m| m.severity.clone())
                    .unwrap_or_else(|| result.extra.severity.clone());
                let finding = Finding {
                    scanner_name: "semgrep".to_string(),
                    rule_id: result.check_id,
                    severity: normalize_severity(&severity),
                    message: result.extra.message,
                    line_start: result.start.line,
                    line_end: result.end.line,
                    confidence: result
                        .extra
                        .metadata
                        .as_ref()
                        .and_then(|m| m.confidence.clone()),
                    cwe: result
                        .extra
                        .metadata
                        .as_ref()
                        .and_then(|m| m.cwe.as_ref())
                        .map(|cwe| cwe.join("; ")),
                    fix_suggestion: result.extra.fix,
                    references: result
                        .extra
                        .metadata
                        .and_then(|m| m.references)
                        .unwrap_or_default(),
                };
                (result.path, finding)
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct SemgrepReport {
    #[serde(default)]
    results: Vec<SemgrepResult>,
}

#[derive(Deserialize)]
struct SemgrepResult {
    check_id: String,
    path: String,
    start: SemgrepPosition,
    end: SemgrepPosition,
    extra: SemgrepExtra,
}

#[derive(Deserialize)]
struct SemgrepPosition {
    line: u32,
}

#[derive(Deserialize)]
struct SemgrepExtra {
    message: String,
    severity: String,
    #[serde(default)]
    fix: Option<String>,
    #[serde(default)]
    metadata: Option<SemgrepMetadata>,
}

#[derive(Deserialize)]
struct SemgrepMetadata {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    cwe: Option<Vec<String>>,
    #[serde(default)]
    references: Option<Vec<String>>,
}

/// Semgrep metadata serializes `cwe` as either a string or a list.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|v| match v {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(list) => list,
    }))
}
