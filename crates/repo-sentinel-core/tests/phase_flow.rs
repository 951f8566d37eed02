use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use repo_sentinel_core::analyzer::AnalyzerOptions;
use repo_sentinel_core::config::{AppConfig, ScannerSettings};
use repo_sentinel_core::error::{Result, SentinelError};
use repo_sentinel_core::llm::Classification;
use repo_sentinel_core::manifest::{
    FileCategory, Finding, ManifestStore, Priority, SecurityRelevance, Severity,
};
use repo_sentinel_core::scanner::VulnScanner;
use repo_sentinel_core::source::RepoSource;
use repo_sentinel_core::testing::{InMemorySource, ScriptedProvider};
use repo_sentinel_core::tokens::{HeuristicEncoder, TokenAccountant};
use repo_sentinel_core::{Phase, PhaseController};
use tokio::process::Command;

/// Scanner double that "runs" by echoing canned findings as JSON, so the
/// real subprocess, timeout, and parse paths are exercised.
struct EchoScanner {
    name: &'static str,
    findings: Vec<(String, Finding)>,
}

impl EchoScanner {
    fn with_findings(findings: Vec<(String, Finding)>) -> Self {
        Self {
            name: "echo-scanner",
            findings,
        }
    }
}

#[async_trait]
impl VulnScanner for EchoScanner {
    fn name(&self) -> &str {
        self.name
    }

    async fn ensure_available(&self, _auto_install: bool) -> Result<()> {
        Ok(())
    }

    fn command(&self, _workdir: &Path, _settings: &ScannerSettings) -> Command {
        let payload = serde_json::to_string(&self.findings).expect("findings serialize");
        let mut command = Command::new("echo");
        command.arg(payload);
        command
    }

    fn parse_findings(&self, stdout: &[u8]) -> Result<Vec<(String, Finding)>> {
        serde_json::from_slice(stdout)
            .map_err(|err| SentinelError::MalformedResponse(err.to_string()))
    }
}

/// Scanner double that outlives its timeout.
struct HangingScanner;

#[async_trait]
impl VulnScanner for HangingScanner {
    fn name(&self) -> &str {
        "hanging-scanner"
    }

    async fn ensure_available(&self, _auto_install: bool) -> Result<()> {
        Ok(())
    }

    fn command(&self, _workdir: &Path, _settings: &ScannerSettings) -> Command {
        let mut command = Command::new("sleep");
        command.arg("30");
        command
    }

    fn parse_findings(&self, _stdout: &[u8]) -> Result<Vec<(String, Finding)>> {
        panic!("a timed-out scanner must never reach parsing");
    }
}

fn finding(severity: Severity) -> Finding {
    Finding {
        scanner_name: "echo-scanner".to_string(),
        rule_id: "R1".to_string(),
        severity,
        message: "hardcoded credential".to_string(),
        line_start: 3,
        line_end: 3,
        confidence: Some("HIGH".to_string()),
        cwe: Some("CWE-798".to_string()),
        fix_suggestion: None,
        references: vec![],
    }
}

fn controller_for(
    source: Arc<dyn RepoSource>,
    store: ManifestStore,
    config: AppConfig,
) -> PhaseController {
    let accountant = TokenAccountant::new(Arc::new(HeuristicEncoder), &config.llm.openai);
    let mut options = AnalyzerOptions::from_config(&config);
    options.workers = 2;
    PhaseController::new(
        config,
        store,
        source,
        "https://github.com/acme/widgets",
        accountant,
    )
    .with_analyzer_options(options)
    .skip_cost_preview(true)
}

fn classify_by_path(path: &str) -> Classification {
    let (category, relevance) = if path.contains("auth") {
        (FileCategory::Authentication, SecurityRelevance::High)
    } else if path.contains("docs") {
        (FileCategory::Documentation, SecurityRelevance::Low)
    } else {
        (FileCategory::Other, SecurityRelevance::Low)
    };
    Classification {
        purpose: format!("Implements {path}"),
        category,
        confidence: 0.9,
        security_relevance: relevance,
        reasoning: "deterministic test classifier".to_string(),
        provider: "scripted".to_string(),
        model: "scripted-1".to_string(),
        input_tokens: None,
        output_tokens: None,
    }
}

#[tokio::test]
async fn empty_repository_flows_through_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree("c1", &[]));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default())
        .with_providers(Arc::new(ScriptedProvider::always_ok()), None);
    controller
        .run(&[
            Phase::Inventory,
            Phase::Classification,
            Phase::VulnerabilityAndRisk,
        ])
        .await
        .unwrap();

    let manifest = store.load().unwrap();
    assert!(manifest.files.is_empty());
    assert_eq!(manifest.repository.commit_sha, "c1");
}

#[tokio::test]
async fn inventory_is_idempotent_and_order_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let store = ManifestStore::new(&path);
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree(
        "c1",
        &[
            ("src/zeta.py", "print('z')"),
            ("src/auth/login.py", "def login(): pass"),
            ("docs/readme.py", "# docs"),
        ],
    ));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default());
    controller.run(&[Phase::Inventory]).await.unwrap();
    let first = std::fs::read(&path).unwrap();

    controller.run(&[Phase::Inventory]).await.unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second, "re-running P1 must be byte-identical");

    let manifest = store.load().unwrap();
    let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["docs/readme.py", "src/auth/login.py", "src/zeta.py"],
        "inventory order is lexicographic and canonical"
    );
}

#[tokio::test]
async fn full_pipeline_enriches_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree(
        "c1",
        &[
            ("src/auth/login.py", "password = input()"),
            ("docs/guide.py", "# documentation module"),
        ],
    ));

    let scanner = EchoScanner::with_findings(vec![(
        "src/auth/login.py".to_string(),
        finding(Severity::Critical),
    )]);

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default())
        .with_providers(Arc::new(ScriptedProvider::with_fn(classify_by_path)), None)
        .with_scanners(vec![Box::new(scanner)]);
    controller
        .run(&[
            Phase::Inventory,
            Phase::TokenAccounting,
            Phase::Classification,
            Phase::VulnerabilityAndRisk,
        ])
        .await
        .unwrap();

    let manifest = store.load().unwrap();

    // order still the P1 order
    let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["docs/guide.py", "src/auth/login.py"]);

    // classification fields survive P3 (monotonic enrichment)
    let auth = manifest.entry("src/auth/login.py").unwrap();
    assert_eq!(auth.category, Some(FileCategory::Authentication));
    assert!(auth.token_stats.is_some());
    assert_eq!(auth.vulnerabilities.as_ref().unwrap().len(), 1);

    // critical finding + authentication + high relevance => 10.0 CRITICAL
    let risk = auth.risk_assessment.as_ref().unwrap();
    assert!((risk.risk_score - 10.0).abs() < 1e-9);
    assert_eq!(risk.priority, Priority::Critical);
    assert_eq!(risk.sla_hours, 4);

    // documentation file, no findings: 0*0.4 + 1*0.35 + 2*0.25 = 0.85 INFO
    let docs = manifest.entry("docs/guide.py").unwrap();
    assert_eq!(docs.vulnerabilities.as_deref(), Some(&[][..]));
    let risk = docs.risk_assessment.as_ref().unwrap();
    assert!((risk.risk_score - 0.85).abs() < 1e-9);
    assert_eq!(risk.priority, Priority::Info);
    assert_eq!(risk.sla_hours, 720);
}

#[tokio::test]
async fn risk_scoring_is_pure_across_reruns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let store = ManifestStore::new(&path);
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree(
        "c1",
        &[("src/auth/login.py", "secret = 'x'")],
    ));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default())
        .with_providers(Arc::new(ScriptedProvider::with_fn(classify_by_path)), None);
    controller
        .run(&[Phase::Inventory, Phase::Classification])
        .await
        .unwrap();

    // P3 twice without scanners: pure re-scoring must not change a byte
    controller.run(&[Phase::VulnerabilityAndRisk]).await.unwrap();
    let first = std::fs::read(&path).unwrap();
    controller.run(&[Phase::VulnerabilityAndRisk]).await.unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn malformed_llm_replies_leave_placeholder_and_continue() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree(
        "c1",
        &[("src/bad.py", "???"), ("src/good.py", "x = 1")],
    ));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default())
        .with_providers(Arc::new(ScriptedProvider::malformed_for("src/bad.py")), None);
    controller
        .run(&[Phase::Inventory, Phase::Classification])
        .await
        .unwrap();

    let manifest = store.load().unwrap();
    let bad = manifest.entry("src/bad.py").unwrap();
    assert_eq!(bad.category, Some(FileCategory::Other));
    assert_eq!(bad.confidence, Some(0.0));
    assert!(bad
        .reasoning
        .as_deref()
        .unwrap()
        .starts_with("analysis_failed:"));

    let good = manifest.entry("src/good.py").unwrap();
    assert!(good.purpose.as_deref().unwrap().contains("src/good.py"));
}

#[tokio::test]
async fn timed_out_scanner_contributes_nothing_but_phase_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> =
        Arc::new(InMemorySource::with_tree("c1", &[("src/app.py", "x = 1")]));

    let mut config = AppConfig::default();
    config.vulnerability_scanning.scanners.insert(
        "hanging-scanner".to_string(),
        ScannerSettings {
            timeout_secs: 1,
            ..ScannerSettings::default()
        },
    );
    config.vulnerability_scanning.scanners.insert(
        "echo-scanner".to_string(),
        ScannerSettings::default(),
    );

    let scanners: Vec<Box<dyn VulnScanner>> = vec![
        Box::new(HangingScanner),
        Box::new(EchoScanner::with_findings(vec![(
            "src/app.py".to_string(),
            finding(Severity::Medium),
        )])),
    ];

    let mut controller = controller_for(Arc::clone(&source), store.clone(), config)
        .with_scanners(scanners);
    controller.run(&[Phase::Inventory, Phase::VulnerabilityAndRisk]).await.unwrap();

    let manifest = store.load().unwrap();
    let entry = manifest.entry("src/app.py").unwrap();
    // only the healthy scanner's finding landed
    let findings = entry.vulnerabilities.as_ref().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Medium);
    assert!(entry.risk_assessment.is_some());
}

#[tokio::test]
async fn commit_drift_fails_with_stale_manifest_and_leaves_disk_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let store = ManifestStore::new(&path);

    let original: Arc<dyn RepoSource> =
        Arc::new(InMemorySource::with_tree("c1", &[("src/app.py", "x = 1")]));
    let mut controller = controller_for(original, store.clone(), AppConfig::default());
    controller.run(&[Phase::Inventory]).await.unwrap();
    let before = std::fs::read(&path).unwrap();

    // the repository moved on between phases
    let drifted: Arc<dyn RepoSource> =
        Arc::new(InMemorySource::with_tree("c2", &[("src/app.py", "x = 2")]));
    let mut controller = controller_for(drifted, store.clone(), AppConfig::default());
    let err = controller
        .run(&[Phase::VulnerabilityAndRisk])
        .await
        .unwrap_err();

    assert!(matches!(err, SentinelError::StaleManifest { .. }));
    assert_eq!(err.exit_code(), 2);
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after, "a stale-manifest failure must not mutate the manifest");
}

#[tokio::test]
async fn declined_cost_preview_cancels_before_any_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> =
        Arc::new(InMemorySource::with_tree("c1", &[("src/app.py", "x = 1")]));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default())
        .with_providers(Arc::new(ScriptedProvider::always_ok()), None)
        .skip_cost_preview(false)
        .with_consent(Box::new(|_| false));
    controller.run(&[Phase::Inventory]).await.unwrap();

    let err = controller.run(&[Phase::Classification]).await.unwrap_err();
    assert!(matches!(err, SentinelError::Cancelled));
    assert_eq!(err.exit_code(), 4);
    // nothing beyond the sampled preview was classified or merged
    let manifest = store.load().unwrap();
    assert!(manifest.entry("src/app.py").unwrap().purpose.is_none());
}

#[tokio::test]
async fn token_accounting_fills_stats_without_llm_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let source: Arc<dyn RepoSource> = Arc::new(InMemorySource::with_tree(
        "c1",
        &[("src/app.py", "import os\nprint(os.name)\n")],
    ));

    let mut controller = controller_for(Arc::clone(&source), store.clone(), AppConfig::default());
    controller
        .run(&[Phase::Inventory, Phase::TokenAccounting])
        .await
        .unwrap();

    let manifest = store.load().unwrap();
    let stats = manifest
        .entry("src/app.py")
        .unwrap()
        .token_stats
        .clone()
        .unwrap();
    assert!(stats.approximate, "heuristic encoder marks stats approximate");
    assert_eq!(stats.total_tokens, stats.prompt_tokens + 150);
    assert!(stats.estimated_cost > 0.0);
    // no purpose was set: token accounting never classifies
    assert!(manifest.entry("src/app.py").unwrap().purpose.is_none());
}
