use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::index::sample;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{Result, SentinelError};
use crate::llm::{prompt, Classification, LlmProvider};
use crate::manifest::{EntryPatch, Manifest, ManifestStore};
use crate::source::RepoSource;
use crate::tokens::TokenAccountant;

const RATE_LIMIT_ATTEMPTS: u32 = 5;
const PER_FILE_ATTEMPTS: u32 = 2;
const BACKOFF_CAP_SECS: u64 = 16;

/// Typical content-token counts per file type, used when sampling is
/// skipped. Scaled by file size before the prompt overhead is added.
const STATIC_TOKEN_ESTIMATES: &[(&str, u64)] = &[
    (".js", 1200),
    (".jsx", 1400),
    (".ts", 1300),
    (".tsx", 1500),
    (".py", 1800),
    (".java", 2200),
    (".cpp", 2000),
    (".c", 1600),
    (".h", 800),
    (".css", 600),
    (".html", 500),
    (".json", 400),
    (".yaml", 300),
    (".yml", 300),
    (".xml", 500),
    (".go", 1400),
    (".rb", 1600),
    (".php", 1500),
    (".cs", 1900),
    (".sql", 800),
];
const STATIC_DEFAULT_TOKENS: u64 = 1_000;
/// Template plus file metadata on top of the content itself.
const STATIC_PROMPT_OVERHEAD: u64 = 250;

/// Estimate content tokens for one file from its extension and size.
fn static_file_tokens(extension: &str, size: u64) -> u64 {
    let base = STATIC_TOKEN_ESTIMATES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, tokens)| *tokens)
        .unwrap_or(STATIC_DEFAULT_TOKENS);
    let multiplier = if size > 50_000 {
        2.0
    } else if size > 20_000 {
        1.5
    } else if size > 5_000 {
        1.2
    } else if size < 1_000 {
        0.5
    } else {
        1.0
    };
    (base as f64 * multiplier) as u64
}

/// Tuning knobs for the classification driver.
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Bounded-concurrency worker count.
    pub workers: usize,
    /// Files sampled for the cost preview; zero skips sampling and projects
    /// from static per-extension estimates.
    pub sample_size: usize,
    /// Re-classify files that already carry a purpose.
    pub reanalyze: bool,
    /// Per-request deadline for one classification call.
    pub request_timeout: Duration,
    pub file_extensions: Vec<String>,
    pub max_file_size: u64,
    /// Input-token budget used to clip file content.
    pub max_input_tokens: u32,
}

impl AnalyzerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.analysis.batch_size,
            sample_size: 3,
            reanalyze: false,
            request_timeout: Duration::from_secs(60),
            file_extensions: config.analysis.file_extensions.clone(),
            max_file_size: config.analysis.max_file_size,
            max_input_tokens: 100_000,
        }
    }
}

/// Pre-flight estimate shown to the operator before the paid run.
#[derive(Debug, Clone)]
pub struct CostPreview {
    pub provider: String,
    pub candidate_count: usize,
    pub sample_size: usize,
    pub projected_input_tokens: u64,
    pub projected_output_tokens: u64,
    pub projected_cost_usd: f64,
    /// 95% band derived from the sample variance.
    pub cost_low_usd: f64,
    pub cost_high_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentSummary {
    pub classified: usize,
    pub placeholders: usize,
    pub fallback_engaged: bool,
}

/// Bounded-concurrency classification driver: candidate selection, sampled
/// cost preview, and the enrichment loop with retry and provider fallback.
pub struct LlmAnalyzer {
    source: Arc<dyn RepoSource>,
    primary: Arc<dyn LlmProvider>,
    fallback: Option<Arc<dyn LlmProvider>>,
    accountant: TokenAccountant,
    options: AnalyzerOptions,
    cancel: CancellationToken,
}

struct FileOutcome {
    path: String,
    classification: Classification,
    primary_exhausted: bool,
}

impl LlmAnalyzer {
    pub fn new(
        source: Arc<dyn RepoSource>,
        primary: Arc<dyn LlmProvider>,
        fallback: Option<Arc<dyn LlmProvider>>,
        accountant: TokenAccountant,
        options: AnalyzerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            primary,
            fallback,
            accountant,
            options,
            cancel,
        }
    }

    /// Whitelisted, size-bounded entries still awaiting classification, in
    /// manifest order.
    pub fn candidates(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .files
            .iter()
            .filter(|entry| {
                self.options
                    .file_extensions
                    .iter()
                    .any(|ext| *ext == entry.extension)
                    && entry.size <= self.options.max_file_size
            })
            .filter(|entry| {
                self.options.reanalyze
                    || entry
                        .purpose
                        .as_deref()
                        .map(str::is_empty)
                        .unwrap_or(true)
            })
            .map(|entry| entry.path.clone())
            .collect()
    }

    /// Classify a uniform random sample of candidates and extrapolate token
    /// and cost totals over the whole candidate set. A sample size of zero
    /// skips sampling and projects from the static per-extension estimates
    /// instead.
    #[instrument(skip(self, manifest))]
    pub async fn cost_preview(&self, manifest: &Manifest) -> Result<CostPreview> {
        let candidates = self.candidates(manifest);
        if candidates.is_empty() {
            return Ok(CostPreview {
                provider: self.primary.name().to_string(),
                candidate_count: 0,
                sample_size: 0,
                projected_input_tokens: 0,
                projected_output_tokens: 0,
                projected_cost_usd: 0.0,
                cost_low_usd: 0.0,
                cost_high_usd: 0.0,
            });
        }
        let sample_size = self.options.sample_size.min(candidates.len());
        if sample_size == 0 {
            return Ok(self.static_preview(manifest, &candidates));
        }

        let mut rng = rand::thread_rng();
        let picked = sample(&mut rng, candidates.len(), sample_size);

        let mut input_counts = Vec::with_capacity(sample_size);
        let mut output_counts = Vec::with_capacity(sample_size);
        for index in picked.iter() {
            let path = &candidates[index];
            let Some(entry) = manifest.entry(path) else {
                continue;
            };
            let bytes = self.source.fetch_blob(&entry.blob_id).await?;
            let content = String::from_utf8_lossy(&bytes);
            let clipped = prompt::clip_for_budget(&content, self.options.max_input_tokens);

            let stats = self
                .accountant
                .account(&entry.path, &entry.extension, clipped.as_bytes());
            let classification = self
                .classify_with_deadline(&self.primary, &entry.path, &entry.extension, &clipped)
                .await?;

            // prefer the provider's observed counts over the local encoder
            input_counts.push(classification.input_tokens.unwrap_or(stats.prompt_tokens) as f64);
            output_counts.push(
                classification
                    .output_tokens
                    .unwrap_or(stats.estimated_response_tokens) as f64,
            );
        }

        let n = candidates.len() as f64;
        let k = input_counts.len().max(1) as f64;
        let mean_in = input_counts.iter().sum::<f64>() / k;
        let mean_out = output_counts.iter().sum::<f64>() / k;
        let per_file_costs: Vec<f64> = input_counts
            .iter()
            .zip(&output_counts)
            .map(|(i, o)| self.accountant.cost_of(*i as u64, *o as u64))
            .collect();
        let mean_cost = per_file_costs.iter().sum::<f64>() / k;
        let variance = per_file_costs
            .iter()
            .map(|c| (c - mean_cost).powi(2))
            .sum::<f64>()
            / k;
        let stderr = (variance / k).sqrt();
        let margin = 1.96 * stderr * n;

        Ok(CostPreview {
            provider: self.primary.name().to_string(),
            candidate_count: candidates.len(),
            sample_size,
            projected_input_tokens: (mean_in * n).round() as u64,
            projected_output_tokens: (mean_out * n).round() as u64,
            projected_cost_usd: mean_cost * n,
            cost_low_usd: (mean_cost * n - margin).max(0.0),
            cost_high_usd: mean_cost * n + margin,
        })
    }

    /// Project tokens and cost over the candidate set from the static
    /// per-extension table, without fetching or classifying anything. There
    /// is no sample variance, so the band collapses to the point estimate.
    fn static_preview(&self, manifest: &Manifest, candidates: &[String]) -> CostPreview {
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        for path in candidates {
            let Some(entry) = manifest.entry(path) else {
                continue;
            };
            input_tokens += static_file_tokens(&entry.extension, entry.size) + STATIC_PROMPT_OVERHEAD;
            output_tokens += prompt::ESTIMATED_RESPONSE_TOKENS;
        }
        let cost = self.accountant.cost_of(input_tokens, output_tokens);
        CostPreview {
            provider: self.primary.name().to_string(),
            candidate_count: candidates.len(),
            sample_size: 0,
            projected_input_tokens: input_tokens,
            projected_output_tokens: output_tokens,
            projected_cost_usd: cost,
            cost_low_usd: cost,
            cost_high_usd: cost,
        }
    }

    /// Run the enrichment loop over every candidate. Results merge in
    /// manifest order (the merge is keyed by path and never reorders
    /// `files`); the manifest checkpoints every `workers` completions when a
    /// store is supplied. Returns `Cancelled` after saving partial progress
    /// if the token fired mid-run.
    #[instrument(skip_all, fields(provider = self.primary.name()))]
    pub async fn enrich(
        &self,
        manifest: &mut Manifest,
        store: Option<&ManifestStore>,
    ) -> Result<EnrichmentSummary> {
        let candidates = self.candidates(manifest);
        info!(candidates = candidates.len(), "starting classification");

        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let primary_dead = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<Option<FileOutcome>> = JoinSet::new();

        for path in candidates {
            let Some(entry) = manifest.entry(&path) else {
                continue;
            };
            let blob_id = entry.blob_id.clone();
            let extension = entry.extension.clone();

            let source = Arc::clone(&self.source);
            let primary = Arc::clone(&self.primary);
            let fallback = self.fallback.clone();
            let semaphore = Arc::clone(&semaphore);
            let primary_dead = Arc::clone(&primary_dead);
            let cancel = self.cancel.clone();
            let request_timeout = self.options.request_timeout;
            let max_input_tokens = self.options.max_input_tokens;

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                // cancellation stops work that has not started; in-flight
                // requests below run to completion or deadline
                if cancel.is_cancelled() {
                    return None;
                }
                let worker = Worker {
                    source,
                    primary,
                    fallback,
                    primary_dead,
                    request_timeout,
                    max_input_tokens,
                };
                Some(worker.classify_file(path, extension, blob_id).await)
            });
        }

        let mut summary = EnrichmentSummary::default();
        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    warn!("classification task panicked: {err}");
                    continue;
                }
            };

            if outcome.primary_exhausted {
                summary.fallback_engaged = true;
            }
            if outcome.classification.is_placeholder() {
                summary.placeholders += 1;
            } else {
                summary.classified += 1;
            }
            manifest.merge_patch(
                &outcome.path,
                EntryPatch {
                    classification: Some(outcome.classification),
                    ..Default::default()
                },
            );

            completed += 1;
            if completed % self.options.workers.max(1) == 0 {
                if let Some(store) = store {
                    store.save(manifest)?;
                }
            }
        }

        if let Some(store) = store {
            store.save(manifest)?;
        }
        info!(
            classified = summary.classified,
            placeholders = summary.placeholders,
            fallback = summary.fallback_engaged,
            "classification finished"
        );

        if self.cancel.is_cancelled() {
            return Err(SentinelError::Cancelled);
        }
        Ok(summary)
    }

    async fn classify_with_deadline(
        &self,
        provider: &Arc<dyn LlmProvider>,
        path: &str,
        extension: &str,
        content: &str,
    ) -> Result<Classification> {
        match tokio::time::timeout(
            self.options.request_timeout,
            provider.classify(path, extension, content),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SentinelError::MalformedResponse(format!(
                "classification of {path} exceeded the request deadline"
            ))),
        }
    }
}

/// Everything one spawned task needs, detached from the analyzer's lifetime.
struct Worker {
    source: Arc<dyn RepoSource>,
    primary: Arc<dyn LlmProvider>,
    fallback: Option<Arc<dyn LlmProvider>>,
    primary_dead: Arc<AtomicBool>,
    request_timeout: Duration,
    max_input_tokens: u32,
}

impl Worker {
    async fn classify_file(&self, path: String, extension: String, blob_id: String) -> FileOutcome {
        let active = self.active_provider();

        let content = match self.source.fetch_blob(&blob_id).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                prompt::clip_for_budget(&text, self.max_input_tokens)
            }
            Err(err) => {
                warn!(path = %path, "blob fetch failed: {err}");
                return FileOutcome {
                    classification: Classification::analysis_failed(
                        active.name(),
                        active.model(),
                        &format!("fetch:{err}"),
                    ),
                    path,
                    primary_exhausted: false,
                };
            }
        };

        let mut primary_exhausted = false;
        let first = self.attempt_provider(&active, &path, &extension, &content).await;
        let classification = match first {
            Ok(classification) => classification,
            Err(SentinelError::ProviderExhausted { .. })
                if Arc::ptr_eq(&active, &self.primary) && self.fallback.is_some() =>
            {
                // provider-wide failure: demote the primary for the rest of
                // the run and redo this file on the secondary
                self.primary_dead.store(true, Ordering::SeqCst);
                primary_exhausted = true;
                let secondary = self.fallback.clone().unwrap_or_else(|| active.clone());
                warn!(path = %path, from = active.name(), to = secondary.name(), "falling back to secondary provider");
                match self
                    .attempt_provider(&secondary, &path, &extension, &content)
                    .await
                {
                    Ok(classification) => classification,
                    Err(err) => Classification::analysis_failed(
                        secondary.name(),
                        secondary.model(),
                        &err.to_string(),
                    ),
                }
            }
            Err(err) => {
                Classification::analysis_failed(active.name(), active.model(), &err.to_string())
            }
        };

        FileOutcome {
            path,
            classification,
            primary_exhausted,
        }
    }

    fn active_provider(&self) -> Arc<dyn LlmProvider> {
        if self.primary_dead.load(Ordering::SeqCst) {
            if let Some(fallback) = &self.fallback {
                return Arc::clone(fallback);
            }
        }
        Arc::clone(&self.primary)
    }

    /// Drive one provider through its retry budget: throttling gets the full
    /// exponential schedule, everything else two attempts.
    async fn attempt_provider(
        &self,
        provider: &Arc<dyn LlmProvider>,
        path: &str,
        extension: &str,
        content: &str,
    ) -> Result<Classification> {
        let mut rate_limit_hits = 0u32;
        let mut other_failures = 0u32;

        loop {
            let attempt = tokio::time::timeout(
                self.request_timeout,
                provider.classify(path, extension, content),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SentinelError::MalformedResponse(
                    "request deadline exceeded".to_string(),
                ))
            });

            match attempt {
                Ok(classification) => return Ok(classification),
                Err(SentinelError::RateLimited { .. }) => {
                    rate_limit_hits += 1;
                    if rate_limit_hits >= RATE_LIMIT_ATTEMPTS {
                        return Err(SentinelError::ProviderExhausted {
                            provider: provider.name().to_string(),
                            attempts: rate_limit_hits,
                        });
                    }
                    let delay = Duration::from_secs(
                        (1u64 << (rate_limit_hits - 1)).min(BACKOFF_CAP_SECS),
                    );
                    debug!(path, delay_secs = delay.as_secs(), "throttled, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    other_failures += 1;
                    if other_failures >= PER_FILE_ATTEMPTS {
                        return Err(err);
                    }
                }
            }
        }
    }
}
