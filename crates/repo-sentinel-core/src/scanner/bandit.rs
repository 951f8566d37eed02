use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{check_min_version, normalize_severity, pip_install, VulnScanner};
use crate::config::ScannerSettings;
use crate::error::{Result, SentinelError};
use crate::manifest::Finding;

const MIN_VERSION: (u32, u32, u32) = (1, 7, 0);

/// Python-specific security linter.
pub struct BanditScanner;

#[async_trait]
impl VulnScanner for BanditScanner {
    fn name(&self) -> &str {
        "bandit"
    }

    async fn ensure_available(&self, auto_install: bool) -> Result<()> {
        match check_min_version("bandit", "bandit", &["--version"], MIN_VERSION).await {
            Ok(()) => Ok(()),
            Err(err) if auto_install => {
                pip_install("bandit", "bandit").await.map_err(|_| err)?;
                check_min_version("bandit", "bandit", &["--version"], MIN_VERSION).await
            }
            Err(err) => Err(err),
        }
    }

    fn command(&self, _workdir: &Path, settings: &ScannerSettings) -> Command {
        let mut command = Command::new("bandit");
        command.args(["-r", ".", "-f", "json", "--quiet"]);
        if let Some(confidence) = &settings.confidence_level {
            match confidence.to_ascii_lowercase().as_str() {
                "high" => {
                    command.arg("-iii");
                }
                "medium" => {
                    command.arg("-ii");
                }
                _ => {}
            }
        }
        if !settings.exclude_patterns.is_empty() {
            let excluded = settings
                .exclude_patterns
                .iter()
                .map(|p| p.trim_end_matches('/'))
                .collect::<Vec<_>>()
                .join(",");
            command.args(["-x", &excluded]);
        }
        command
    }

    fn parse_findings(&self, stdout: &[u8]) -> Result<Vec<(String, Finding)>> {
        let report: BanditReport = serde_json::from_slice(stdout)
            .map_err(|err| SentinelError::MalformedResponse(format!("bandit output: {err}")))?;

        Ok(report
            .results
            .into_iter()
            .map(|result| {
                let line_start = result
                    .line_range
                    .first()
                    .copied()
                    .unwrap_or(result.line_number);
                let line_end = result
                    .line_range
                    .last()
                    .copied()
                    .unwrap_or(result.line_number);
                let finding = Finding {
                    scanner_name: "bandit".to_string(),
                    rule_id: result.test_id,
                    severity: normalize_severity(&result.issue_severity),
                    message: result.issue_text,
                    line_start,
                    line_end,
                    confidence: Some(result.issue_confidence),
                    cwe: result.issue_cwe.map(|cwe| format!("CWE-{}", cwe.id)),
                    fix_suggestion: None,
                    references: result.more_info.into_iter().collect(),
                };
                let path = result
                    .filename
                    .strip_prefix("./")
                    .unwrap_or(&result.filename)
                    .to_string();
                (path, finding)
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct BanditReport {
    #[serde(default)]
    results: Vec<BanditResult>,
}

#[derive(Deserialize)]
struct BanditResult {
    filename: String,
    test_id: String,
    issue_severity: String,
    issue_confidence: String,
    issue_text: String,
    line_number: u32,
    #[serde(default)]
    line_range: Vec<u32>,
    #[serde(default)]
    issue_cwe: Option<BanditCwe>,
    #[serde(default)]
    more_info: Option<String>,
}

#[derive(Deserialize)]
struct BanditCwe {
    id: u32,
}
