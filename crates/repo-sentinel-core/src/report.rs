use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::config::ProviderSettings;
use crate::error::{Result, SentinelError};
use crate::manifest::Manifest;
use crate::tokens::RepoTokenStats;

const LISTING_LIMIT: usize = 20;

/// Render the human summary for `show`.
pub fn render_summary(manifest: &Manifest) -> String {
    let mut out = String::new();
    let repo = &manifest.repository;
    let _ = writeln!(out, "Repository: {}", repo.url);
    let _ = writeln!(out, "Default branch: {}", repo.default_branch);
    let _ = writeln!(out, "Commit: {}", repo.commit_sha);
    let _ = writeln!(out, "First analysis: {}", repo.analysis_timestamp);
    let _ = writeln!(out, "Tracked files: {}", manifest.files.len());

    if !manifest.files.is_empty() {
        let _ = writeln!(out, "\nFiles:");
        for entry in manifest.files.iter().take(LISTING_LIMIT) {
            let _ = writeln!(
                out,
                "  {} ({:.1} KB)",
                entry.path,
                entry.size as f64 / 1024.0
            );
        }
        if manifest.files.len() > LISTING_LIMIT {
            let _ = writeln!(
                out,
                "  ... and {} more files",
                manifest.files.len() - LISTING_LIMIT
            );
        }

        let mut by_extension: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &manifest.files {
            *by_extension.entry(entry.extension.as_str()).or_default() += 1;
        }
        let _ = writeln!(out, "\nFile types:");
        for (extension, count) in by_extension {
            let label = if extension.is_empty() { "(none)" } else { extension };
            let _ = writeln!(out, "  {label}: {count} files");
        }
    }

    let classified = manifest
        .files
        .iter()
        .filter(|e| e.category.is_some())
        .count();
    if classified > 0 {
        let placeholders = manifest
            .files
            .iter()
            .filter(|e| {
                e.reasoning
                    .as_deref()
                    .map(|r| r.starts_with("analysis_failed:"))
                    .unwrap_or(false)
            })
            .count();
        let _ = writeln!(out, "\nClassified: {classified} files");
        if placeholders > 0 {
            let _ = writeln!(out, "Placeholder classifications: {placeholders}");
        }
    }

    // "scanned with no findings" and "not scanned" are different states
    let scanned = manifest
        .files
        .iter()
        .filter(|e| e.vulnerabilities.is_some())
        .count();
    if scanned > 0 {
        let findings: usize = manifest
            .files
            .iter()
            .filter_map(|e| e.vulnerabilities.as_ref())
            .map(Vec::len)
            .sum();
        let _ = writeln!(
            out,
            "\nScanned: {scanned} files, {} not scanned, {findings} findings",
            manifest.files.len() - scanned
        );
    }

    let mut by_priority: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &manifest.files {
        if let Some(risk) = &entry.risk_assessment {
            let label = serde_json::to_string(&risk.priority)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            *by_priority.entry(label).or_default() += 1;
        }
    }
    if !by_priority.is_empty() {
        let _ = writeln!(out, "\nRisk priorities:");
        for (priority, count) in by_priority {
            let _ = writeln!(out, "  {priority}: {count} files");
        }
    }

    out
}

#[derive(Serialize)]
struct TokenReport<'a> {
    repository_stats: &'a RepoTokenStats,
    file_stats: Vec<FileTokenLine<'a>>,
    pricing_info: PricingInfo<'a>,
    analysis_metadata: AnalysisMetadata<'a>,
}

#[derive(Serialize)]
struct FileTokenLine<'a> {
    file_path: &'a str,
    file_size_bytes: u64,
    #[serde(flatten)]
    stats: &'a crate::manifest::TokenStats,
}

#[derive(Serialize)]
struct PricingInfo<'a> {
    model: &'a str,
    input_price_per_1k_tokens: f64,
    output_price_per_1k_tokens: f64,
    currency: &'static str,
}

#[derive(Serialize)]
struct AnalysisMetadata<'a> {
    encoder: &'a str,
}

/// Write the standalone token-analysis document produced when token
/// accounting runs on its own.
pub fn write_token_report(
    path: &Path,
    manifest: &Manifest,
    aggregate: &RepoTokenStats,
    encoder_name: &str,
    pricing: &ProviderSettings,
) -> Result<()> {
    let report = TokenReport {
        repository_stats: aggregate,
        file_stats: manifest
            .files
            .iter()
            .filter_map(|entry| {
                entry.token_stats.as_ref().map(|stats| FileTokenLine {
                    file_path: &entry.path,
                    file_size_bytes: entry.size,
                    stats,
                })
            })
            .collect(),
        pricing_info: PricingInfo {
            model: &pricing.model,
            input_price_per_1k_tokens: pricing.input_rate_per_1k,
            output_price_per_1k_tokens: pricing.output_rate_per_1k,
            currency: "USD",
        },
        analysis_metadata: AnalysisMetadata {
            encoder: encoder_name,
        },
    };
    let json = serde_json::to_vec_pretty(&report)
        .map_err(|err| SentinelError::CorruptManifest(err.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}
