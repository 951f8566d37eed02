use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{ScannerSettings, VulnScanConfig};
use crate::error::{Result, SentinelError};
use crate::manifest::{Finding, Manifest, Severity};
use crate::source::RepoSource;

pub mod bandit;
pub mod semgrep;

pub use bandit::BanditScanner;
pub use semgrep::SemgrepScanner;

/// One external static-analysis tool. Implementations own tool-specific
/// invocation flags and output parsing; the runner owns the working tree,
/// timeouts, and attachment.
#[async_trait]
pub trait VulnScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Verify the executable is installed at or above the minimum version,
    /// provisioning it first when `auto_install` is set.
    async fn ensure_available(&self, auto_install: bool) -> Result<()>;

    /// The scan invocation, rooted at the scratch working tree.
    fn command(&self, workdir: &Path, settings: &ScannerSettings) -> Command;

    /// Parse native structured output into `(repo-relative path, finding)`
    /// pairs.
    fn parse_findings(&self, stdout: &[u8]) -> Result<Vec<(String, Finding)>>;
}

/// Registry keyed by scanner name.
pub fn build_scanner(name: &str) -> Result<Box<dyn VulnScanner>> {
    match name {
        "semgrep" => Ok(Box::new(SemgrepScanner)),
        "bandit" => Ok(Box::new(BanditScanner)),
        other => Err(SentinelError::ScannerUnavailable(other.to_string())),
    }
}

/// Map a scanner-native severity label onto the canonical set.
pub fn normalize_severity(raw: &str) -> Severity {
    match raw.to_ascii_uppercase().as_str() {
        "CRITICAL" => Severity::Critical,
        "ERROR" | "HIGH" => Severity::High,
        "WARNING" | "MEDIUM" => Severity::Medium,
        "LOW" => Severity::Low,
        "INFO" | "INFORMATIONAL" => Severity::Info,
        _ => Severity::Low,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub ran: Vec<String>,
    pub skipped: Vec<String>,
    pub findings_attached: usize,
}

/// Acquires a scratch working tree, runs each requested scanner in turn,
/// and attaches normalized findings to the manifest. Scanners run
/// sequentially over one shared clone.
pub struct ScannerRunner {
    scanners: Vec<Box<dyn VulnScanner>>,
    config: VulnScanConfig,
    file_extensions: Vec<String>,
    cancel: CancellationToken,
}

impl ScannerRunner {
    pub fn new(
        scanners: Vec<Box<dyn VulnScanner>>,
        config: VulnScanConfig,
        file_extensions: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scanners,
            config,
            file_extensions,
            cancel,
        }
    }

    /// Run every scanner against the manifest's pinned commit. Per-scanner
    /// failures demote that scanner to skipped; only an unavailable sole
    /// scanner is fatal. `checkpoint` is called after each scanner merges.
    #[instrument(skip_all, fields(commit = %manifest.repository.commit_sha))]
    pub async fn run(
        &self,
        source: &dyn RepoSource,
        manifest: &mut Manifest,
        checkpoint: &mut dyn FnMut(&Manifest) -> Result<()>,
    ) -> Result<ScanSummary> {
        // scratch tree lives for the whole phase and is removed on every
        // exit path when the guard drops
        let scratch = tempfile::tempdir()?;
        source
            .clone_at(&manifest.repository.commit_sha, scratch.path())
            .await?;

        let sole_scanner = self.scanners.len() == 1;
        let mut summary = ScanSummary::default();

        for scanner in &self.scanners {
            if self.cancel.is_cancelled() {
                checkpoint(manifest)?;
                return Err(SentinelError::Cancelled);
            }

            let name = scanner.name().to_string();
            let settings = self
                .config
                .scanners
                .get(&name)
                .cloned()
                .unwrap_or_default();
            if !settings.enabled {
                summary.skipped.push(name);
                continue;
            }

            if let Err(err) = scanner.ensure_available(self.config.auto_install).await {
                if sole_scanner {
                    return Err(err);
                }
                warn!(scanner = %name, "skipping unavailable scanner: {err}");
                summary.skipped.push(name);
                continue;
            }

            match self
                .invoke_scanner(scanner.as_ref(), scratch.path(), &settings)
                .await
            {
                Ok(findings) => {
                    summary.findings_attached += self.attach(manifest, findings);
                    summary.ran.push(name);
                    checkpoint(manifest)?;
                }
                Err(err) => {
                    warn!(scanner = %name, "scanner contributed nothing: {err}");
                    summary.skipped.push(name);
                }
            }
        }

        info!(
            ran = summary.ran.len(),
            skipped = summary.skipped.len(),
            findings = summary.findings_attached,
            "vulnerability scan finished"
        );
        Ok(summary)
    }

    async fn invoke_scanner(
        &self,
        scanner: &dyn VulnScanner,
        workdir: &Path,
        settings: &ScannerSettings,
    ) -> Result<Vec<(String, Finding)>> {
        let mut command = scanner.command(workdir, settings);
        command.current_dir(workdir).kill_on_drop(true);

        let wait = Duration::from_secs(settings.timeout_secs);
        let output = match tokio::time::timeout(wait, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(SentinelError::ScannerUnavailable(format!(
                    "{}: {err}",
                    scanner.name()
                )))
            }
            // partial output from a timed-out scanner cannot be trusted
            Err(_) => {
                return Err(SentinelError::ScannerTimeout {
                    scanner: scanner.name().to_string(),
                    seconds: settings.timeout_secs,
                })
            }
        };

        scanner.parse_findings(&output.stdout)
    }

    /// Merge findings into the manifest by path. Every whitelisted tracked
    /// file is marked as scanned; findings for untracked or non-whitelisted
    /// paths are dropped. Per-file findings cap at the configured maximum,
    /// earliest kept.
    fn attach(&self, manifest: &mut Manifest, findings: Vec<(String, Finding)>) -> usize {
        for entry in &mut manifest.files {
            let whitelisted = self
                .file_extensions
                .iter()
                .any(|ext| *ext == entry.extension);
            if whitelisted && entry.vulnerabilities.is_none() {
                entry.vulnerabilities = Some(Vec::new());
            }
        }

        let cap = self.config.max_findings_per_file;
        let mut attached = 0usize;
        for (path, finding) in findings {
            let path = path.strip_prefix("./").unwrap_or(&path).to_string();
            let Some(entry) = manifest.entry_mut(&path) else {
                continue;
            };
            if !self
                .file_extensions
                .iter()
                .any(|ext| *ext == entry.extension)
            {
                continue;
            }
            let list = entry.vulnerabilities.get_or_insert_with(Vec::new);
            if list.len() < cap {
                list.push(finding);
                attached += 1;
            }
        }
        attached
    }
}

/// Check `exe --version`-style output against a minimum version. Missing
/// executables and unparsable output both read as unavailable.
pub(crate) async fn check_min_version(
    name: &str,
    exe: &str,
    args: &[&str],
    min: (u32, u32, u32),
) -> Result<()> {
    let output = Command::new(exe)
        .args(args)
        .output()
        .await
        .map_err(|err| SentinelError::ScannerUnavailable(format!("{name}: {err}")))?;
    let text = String::from_utf8_lossy(&output.stdout).to_string()
        + &String::from_utf8_lossy(&output.stderr);
    let version = parse_version(&text).ok_or_else(|| {
        SentinelError::ScannerUnavailable(format!("{name}: no version in `{}`", text.trim()))
    })?;
    if version < min {
        return Err(SentinelError::ScannerUnavailable(format!(
            "{name}: version {}.{}.{} below required {}.{}.{}",
            version.0, version.1, version.2, min.0, min.1, min.2
        )));
    }
    Ok(())
}

/// Install a tool through its standard packaging channel (pip).
pub(crate) async fn pip_install(name: &str, package: &str) -> Result<()> {
    info!(package, "auto-installing scanner");
    let output = Command::new("python3")
        .args(["-m", "pip", "install", "--user", "--quiet", package])
        .output()
        .await
        .map_err(|err| SentinelError::ScannerUnavailable(format!("{name}: {err}")))?;
    if !output.status.success() {
        return Err(SentinelError::ScannerUnavailable(format!(
            "{name}: pip install failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let mut parts = token.split('.');
        if let (Some(major), Some(minor)) = (parts.next(), parts.next()) {
            if let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) {
                let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                return Some((major, minor, patch));
            }
        }
    }
    None
}
