use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::warn;

use crate::config::ProviderSettings;
use crate::llm::prompt;
use crate::manifest::{Manifest, TokenStats};

/// Byte-level token encoder, treated as an external service. The heuristic
/// estimator stands in when the real encoder is unavailable.
pub trait TokenEncoder: Send + Sync {
    fn count(&self, text: &str) -> usize;
    fn name(&self) -> &str;
    /// False for length-based estimation; recorded on each `TokenStats`.
    fn is_exact(&self) -> bool;
}

/// cl100k_base BPE encoder.
pub struct Cl100kEncoder {
    bpe: tiktoken_rs::CoreBPE,
}

impl Cl100kEncoder {
    pub fn new() -> Option<Self> {
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(Self { bpe }),
            Err(err) => {
                warn!("cl100k_base encoder unavailable: {err}");
                None
            }
        }
    }
}

impl TokenEncoder for Cl100kEncoder {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn is_exact(&self) -> bool {
        true
    }
}

/// Length-based fallback: one token per four bytes.
pub struct HeuristicEncoder;

impl TokenEncoder for HeuristicEncoder {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }

    fn name(&self) -> &str {
        "heuristic-len/4"
    }

    fn is_exact(&self) -> bool {
        false
    }
}

/// Best encoder available on this host. Building the BPE tables is costly,
/// so the instance is shared process-wide.
pub fn default_encoder() -> Arc<dyn TokenEncoder> {
    static ENCODER: Lazy<Arc<dyn TokenEncoder>> = Lazy::new(|| match Cl100kEncoder::new() {
        Some(encoder) => Arc::new(encoder),
        None => Arc::new(HeuristicEncoder),
    });
    Arc::clone(&ENCODER)
}

/// Computes per-file token statistics and translates them into projected
/// USD cost under the selected provider's pricing.
#[derive(Clone)]
pub struct TokenAccountant {
    encoder: Arc<dyn TokenEncoder>,
    input_rate_per_1k: f64,
    output_rate_per_1k: f64,
}

impl TokenAccountant {
    pub fn new(encoder: Arc<dyn TokenEncoder>, settings: &ProviderSettings) -> Self {
        Self {
            encoder,
            input_rate_per_1k: settings.input_rate_per_1k,
            output_rate_per_1k: settings.output_rate_per_1k,
        }
    }

    pub fn encoder_name(&self) -> &str {
        self.encoder.name()
    }

    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1000.0 * self.input_rate_per_1k
            + output_tokens as f64 / 1000.0 * self.output_rate_per_1k
    }

    /// Account one file. Raw bytes are decoded as UTF-8 with replacement;
    /// the prompt token count covers the full templated prompt, not just
    /// the file content.
    pub fn account(&self, path: &str, extension: &str, content: &[u8]) -> TokenStats {
        let text = String::from_utf8_lossy(content);
        let content_tokens = self.encoder.count(&text) as u64;
        let full_prompt = prompt::analysis_prompt(path, extension, &text);
        let prompt_tokens = self.encoder.count(&full_prompt) as u64;
        let estimated_response_tokens = prompt::ESTIMATED_RESPONSE_TOKENS;
        let total_tokens = prompt_tokens + estimated_response_tokens;

        TokenStats {
            content_tokens,
            prompt_tokens,
            estimated_response_tokens,
            total_tokens,
            estimated_cost: self.cost_of(prompt_tokens, estimated_response_tokens),
            approximate: !self.encoder.is_exact(),
        }
    }
}

/// Aggregated token statistics for a whole repository, written alongside the
/// manifest when token accounting runs standalone.
#[derive(Debug, Clone, Serialize)]
pub struct RepoTokenStats {
    pub total_files: usize,
    pub analyzed_files: usize,
    pub total_content_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_response_tokens: u64,
    pub total_tokens: u64,
    pub estimated_total_cost_usd: f64,
    pub average_tokens_per_file: f64,
    pub median_tokens_per_file: f64,
    pub largest_file_tokens: u64,
    pub largest_file_path: String,
}

impl RepoTokenStats {
    pub fn aggregate(manifest: &Manifest) -> Self {
        let accounted: Vec<(&str, &TokenStats)> = manifest
            .files
            .iter()
            .filter_map(|entry| {
                entry
                    .token_stats
                    .as_ref()
                    .map(|stats| (entry.path.as_str(), stats))
            })
            .collect();

        if accounted.is_empty() {
            return Self {
                total_files: manifest.files.len(),
                analyzed_files: 0,
                total_content_tokens: 0,
                total_prompt_tokens: 0,
                total_response_tokens: 0,
                total_tokens: 0,
                estimated_total_cost_usd: 0.0,
                average_tokens_per_file: 0.0,
                median_tokens_per_file: 0.0,
                largest_file_tokens: 0,
                largest_file_path: String::new(),
            };
        }

        let mut totals: Vec<u64> = accounted.iter().map(|(_, s)| s.total_tokens).collect();
        totals.sort_unstable();
        let median = if totals.len() % 2 == 1 {
            totals[totals.len() / 2] as f64
        } else {
            (totals[totals.len() / 2 - 1] + totals[totals.len() / 2]) as f64 / 2.0
        };
        let (largest_path, largest) = accounted
            .iter()
            .max_by_key(|(_, s)| s.total_tokens)
            .map(|(p, s)| (p.to_string(), s.total_tokens))
            .unwrap_or_default();

        let total_tokens: u64 = totals.iter().sum();
        Self {
            total_files: manifest.files.len(),
            analyzed_files: accounted.len(),
            total_content_tokens: accounted.iter().map(|(_, s)| s.content_tokens).sum(),
            total_prompt_tokens: accounted.iter().map(|(_, s)| s.prompt_tokens).sum(),
            total_response_tokens: accounted
                .iter()
                .map(|(_, s)| s.estimated_response_tokens)
                .sum(),
            total_tokens,
            estimated_total_cost_usd: accounted.iter().map(|(_, s)| s.estimated_cost).sum(),
            average_tokens_per_file: total_tokens as f64 / accounted.len() as f64,
            median_tokens_per_file: median,
            largest_file_tokens: largest,
            largest_file_path: largest_path,
        }
    }
}
