use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::analyzer::{AnalyzerOptions, CostPreview, LlmAnalyzer};
use crate::config::AppConfig;
use crate::error::{Result, SentinelError};
use crate::llm::LlmProvider;
use crate::manifest::{
    EntryPatch, InventoryRecord, Manifest, ManifestStore, RepositoryInfo,
};
use crate::risk::RiskScorer;
use crate::scanner::{ScannerRunner, VulnScanner};
use crate::source::{extension_of, RepoSource};
use crate::tokens::{RepoTokenStats, TokenAccountant};

/// One enrichment pass over the manifest. Phases are composable and
/// idempotent; each reads the current manifest, merges its output, and
/// persists before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// P1: inventory the repository at the pinned commit.
    Inventory,
    /// P1.5: token counts and cost projection, no LLM calls.
    TokenAccounting,
    /// P2.5: LLM classification.
    Classification,
    /// P3: vulnerability scan plus risk scoring.
    VulnerabilityAndRisk,
}

impl Phase {
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim() {
            "1" => Ok(Phase::Inventory),
            "1.5" => Ok(Phase::TokenAccounting),
            "2.5" => Ok(Phase::Classification),
            "3" => Ok(Phase::VulnerabilityAndRisk),
            other => Err(SentinelError::ConfigInvalid(format!(
                "unknown phase `{other}` (expected 1, 1.5, 2.5 or 3)"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Phase::Inventory => "P1 inventory",
            Phase::TokenAccounting => "P1.5 token accounting",
            Phase::Classification => "P2.5 classification",
            Phase::VulnerabilityAndRisk => "P3 vulnerability & risk",
        }
    }
}

/// Operator decision on a presented cost preview.
pub type ConsentFn = Box<dyn Fn(&CostPreview) -> bool + Send + Sync>;

/// Wires the subsystems together and drives the requested phases in order,
/// persisting after each. The cancellation token reaches every component.
pub struct PhaseController {
    config: AppConfig,
    store: ManifestStore,
    source: Arc<dyn RepoSource>,
    repo_url: String,
    primary: Option<Arc<dyn LlmProvider>>,
    fallback: Option<Arc<dyn LlmProvider>>,
    scanners: Vec<Box<dyn VulnScanner>>,
    accountant: TokenAccountant,
    analyzer_options: AnalyzerOptions,
    consent: ConsentFn,
    skip_preview: bool,
    cancel: CancellationToken,
}

impl PhaseController {
    pub fn new(
        config: AppConfig,
        store: ManifestStore,
        source: Arc<dyn RepoSource>,
        repo_url: &str,
        accountant: TokenAccountant,
    ) -> Self {
        let analyzer_options = AnalyzerOptions::from_config(&config);
        Self {
            config,
            store,
            source,
            repo_url: repo_url.to_string(),
            primary: None,
            fallback: None,
            scanners: Vec::new(),
            accountant,
            analyzer_options,
            consent: Box::new(|_| true),
            skip_preview: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_providers(
        mut self,
        primary: Arc<dyn LlmProvider>,
        fallback: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        self.primary = Some(primary);
        self.fallback = fallback;
        self
    }

    pub fn with_scanners(mut self, scanners: Vec<Box<dyn VulnScanner>>) -> Self {
        self.scanners = scanners;
        self
    }

    pub fn with_consent(mut self, consent: ConsentFn) -> Self {
        self.consent = consent;
        self
    }

    pub fn skip_cost_preview(mut self, skip: bool) -> Self {
        self.skip_preview = skip;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_analyzer_options(mut self, options: AnalyzerOptions) -> Self {
        self.analyzer_options = options;
        self
    }

    /// Run the requested phases in canonical order, deduplicated.
    pub async fn run(&mut self, phases: &[Phase]) -> Result<()> {
        let mut ordered = phases.to_vec();
        ordered.sort();
        ordered.dedup();

        for phase in ordered {
            info!(phase = phase.label(), "phase running");
            let outcome = match phase {
                Phase::Inventory => self.run_inventory().await.map(|_| ()),
                Phase::TokenAccounting => self.run_token_accounting().await.map(|_| ()),
                Phase::Classification => self.run_classification().await,
                Phase::VulnerabilityAndRisk => self.run_vulnerability_and_risk().await,
            };
            match outcome {
                Ok(()) => info!(phase = phase.label(), "phase completed"),
                Err(SentinelError::Cancelled) => {
                    warn!(phase = phase.label(), "phase cancelled, partial progress saved");
                    return Err(SentinelError::Cancelled);
                }
                Err(err) => {
                    warn!(phase = phase.label(), "phase failed: {err}");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Load the manifest pinned to the current head, or create it on first
    /// run. Any phase operating on an existing manifest whose pinned commit
    /// disagrees with the freshly resolved head fails before mutating
    /// anything.
    async fn ensure_manifest(&self) -> Result<Manifest> {
        let head = self.source.resolve().await?;
        if self.store.exists() {
            let manifest = self.store.load()?;
            if manifest.repository.commit_sha != head.commit_sha {
                return Err(SentinelError::StaleManifest {
                    expected: manifest.repository.commit_sha,
                    actual: head.commit_sha,
                });
            }
            Ok(manifest)
        } else {
            Ok(Manifest::new(RepositoryInfo {
                url: self.repo_url.clone(),
                default_branch: head.default_branch,
                commit_sha: head.commit_sha,
                analysis_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }))
        }
    }

    #[instrument(skip(self))]
    pub async fn run_inventory(&self) -> Result<Manifest> {
        let mut manifest = self.ensure_manifest().await?;
        let files = self
            .source
            .list_files(&manifest.repository.commit_sha)
            .await?;
        let records: Vec<InventoryRecord> = files
            .into_iter()
            .map(|file| InventoryRecord {
                extension: extension_of(&file.path),
                path: file.path,
                blob_id: file.blob_id,
                size: file.size,
            })
            .collect();
        info!(files = records.len(), "inventory listed");
        manifest.merge_inventory(records);
        self.store.save(&manifest)?;
        Ok(manifest)
    }

    #[instrument(skip(self))]
    pub async fn run_token_accounting(&self) -> Result<RepoTokenStats> {
        let mut manifest = self.ensure_manifest().await?;

        let targets: Vec<(String, String, String)> = manifest
            .files
            .iter()
            .filter(|entry| self.config.is_analyzable(&entry.extension, entry.size))
            .map(|entry| {
                (
                    entry.path.clone(),
                    entry.extension.clone(),
                    entry.blob_id.clone(),
                )
            })
            .collect();

        for (path, extension, blob_id) in targets {
            if self.cancel.is_cancelled() {
                self.store.save(&manifest)?;
                return Err(SentinelError::Cancelled);
            }
            let bytes = self.source.fetch_blob(&blob_id).await?;
            let stats = self.accountant.account(&path, &extension, &bytes);
            manifest.merge_patch(
                &path,
                EntryPatch {
                    token_stats: Some(stats),
                    ..Default::default()
                },
            );
        }

        self.store.save(&manifest)?;
        let aggregate = RepoTokenStats::aggregate(&manifest);
        info!(
            analyzed = aggregate.analyzed_files,
            total_tokens = aggregate.total_tokens,
            estimated_cost_usd = aggregate.estimated_total_cost_usd,
            "token accounting finished"
        );
        Ok(aggregate)
    }

    #[instrument(skip(self))]
    pub async fn run_classification(&self) -> Result<()> {
        let primary = self.primary.clone().ok_or_else(|| {
            SentinelError::ConfigInvalid("no LLM provider configured for classification".to_string())
        })?;
        let mut manifest = self.ensure_manifest().await?;

        let analyzer = LlmAnalyzer::new(
            Arc::clone(&self.source),
            primary,
            self.fallback.clone(),
            self.accountant.clone(),
            self.analyzer_options.clone(),
            self.cancel.clone(),
        );

        if !self.skip_preview {
            let preview = analyzer.cost_preview(&manifest).await?;
            if preview.candidate_count > 0 && !(self.consent)(&preview) {
                info!("operator declined the projected cost");
                return Err(SentinelError::Cancelled);
            }
        }

        let summary = analyzer.enrich(&mut manifest, Some(&self.store)).await?;
        if summary.placeholders > 0 {
            warn!(
                placeholders = summary.placeholders,
                "some files recorded placeholder classifications"
            );
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_vulnerability_and_risk(&mut self) -> Result<()> {
        let mut manifest = self.ensure_manifest().await?;

        if !self.scanners.is_empty() {
            let scanners = std::mem::take(&mut self.scanners);
            let runner = ScannerRunner::new(
                scanners,
                self.config.vulnerability_scanning.clone(),
                self.config.analysis.file_extensions.clone(),
                self.cancel.clone(),
            );
            let store = self.store.clone();
            let mut checkpoint = move |manifest: &Manifest| store.save(manifest);
            runner
                .run(self.source.as_ref(), &mut manifest, &mut checkpoint)
                .await?;
        }

        // every entry gets a score; entries without classification use the
        // scorer's defaults
        let scorer = RiskScorer::new(self.config.risk_scoring.clone())?;
        let assessments: Vec<(String, _)> = manifest
            .files
            .iter()
            .map(|entry| (entry.path.clone(), scorer.assess(entry)))
            .collect();
        for (path, assessment) in assessments {
            manifest.merge_patch(
                &path,
                EntryPatch {
                    risk_assessment: Some(assessment),
                    ..Default::default()
                },
            );
        }

        self.store.save(&manifest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parsing_accepts_the_four_known_phases() {
        assert_eq!(Phase::parse("1").unwrap(), Phase::Inventory);
        assert_eq!(Phase::parse("1.5").unwrap(), Phase::TokenAccounting);
        assert_eq!(Phase::parse("2.5").unwrap(), Phase::Classification);
        assert_eq!(Phase::parse("3").unwrap(), Phase::VulnerabilityAndRisk);
        assert!(Phase::parse("2").is_err());
        assert!(Phase::parse("").is_err());
    }

    #[test]
    fn phases_order_canonically() {
        let mut phases = vec![
            Phase::VulnerabilityAndRisk,
            Phase::Inventory,
            Phase::Classification,
            Phase::TokenAccounting,
        ];
        phases.sort();
        assert_eq!(
            phases,
            vec![
                Phase::Inventory,
                Phase::TokenAccounting,
                Phase::Classification,
                Phase::VulnerabilityAndRisk,
            ]
        );
    }
}
