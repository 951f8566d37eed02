use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};
use crate::manifest::{FileCategory, FileEntry, Priority, RiskAssessment, SecurityRelevance, Severity};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Relative weight of each risk component. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentWeights {
    pub vulnerability_severity: f64,
    pub file_category: f64,
    pub security_relevance: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            vulnerability_severity: 0.40,
            file_category: 0.35,
            security_relevance: 0.25,
        }
    }
}

/// Risk-score cutoffs, checked in descending order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            critical: 8.0,
            high: 6.0,
            medium: 4.0,
            low: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaHours {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub info: u32,
}

impl Default for SlaHours {
    fn default() -> Self {
        Self {
            critical: 4,
            high: 24,
            medium: 72,
            low: 168,
            info: 720,
        }
    }
}

/// Optional score inflation for files carrying many findings. Disabled by
/// default so the score stays the pure weighted form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnerabilityCountModifier {
    pub enabled: bool,
    pub base_multiplier: f64,
    pub max_multiplier: f64,
    pub critical_high_boost: f64,
}

impl Default for VulnerabilityCountModifier {
    fn default() -> Self {
        Self {
            enabled: false,
            base_multiplier: 0.1,
            max_multiplier: 1.5,
            critical_high_boost: 1.0,
        }
    }
}

/// Full risk-scoring configuration. May live inside the main config file or
/// in a standalone YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: ComponentWeights,
    pub vulnerability_severity_scores: BTreeMap<Severity, f64>,
    pub file_category_scores: BTreeMap<FileCategory, f64>,
    pub security_relevance_scores: BTreeMap<SecurityRelevance, f64>,
    pub priority_thresholds: PriorityThresholds,
    pub sla_hours: SlaHours,
    pub vulnerability_count: VulnerabilityCountModifier,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let vulnerability_severity_scores = BTreeMap::from([
            (Severity::Critical, 10.0),
            (Severity::High, 7.0),
            (Severity::Medium, 4.0),
            (Severity::Low, 1.0),
            (Severity::Info, 0.0),
        ]);
        let file_category_scores = BTreeMap::from([
            (FileCategory::Authentication, 10.0),
            (FileCategory::Api, 8.0),
            (FileCategory::DataProcessing, 7.0),
            (FileCategory::Config, 6.0),
            (FileCategory::Frontend, 4.0),
            (FileCategory::Build, 3.0),
            (FileCategory::Test, 2.0),
            (FileCategory::Documentation, 1.0),
            (FileCategory::Other, 3.0),
        ]);
        let security_relevance_scores = BTreeMap::from([
            (SecurityRelevance::High, 10.0),
            (SecurityRelevance::Medium, 5.0),
            (SecurityRelevance::Low, 2.0),
        ]);
        Self {
            weights: ComponentWeights::default(),
            vulnerability_severity_scores,
            file_category_scores,
            security_relevance_scores,
            priority_thresholds: PriorityThresholds::default(),
            sla_hours: SlaHours::default(),
            vulnerability_count: VulnerabilityCountModifier::default(),
        }
    }
}

impl RiskConfig {
    /// Load from a standalone YAML document.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SentinelError::ConfigInvalid(format!(
                "cannot read risk config {}: {err}",
                path.display()
            ))
        })?;
        let cfg: RiskConfig = serde_yaml::from_str(&raw)
            .map_err(|err| SentinelError::ConfigInvalid(format!("invalid risk config: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let sum = self.weights.vulnerability_severity
            + self.weights.file_category
            + self.weights.security_relevance;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(SentinelError::ConfigInvalid(format!(
                "risk component weights must sum to 1.0 (got {sum})"
            )));
        }
        if self.priority_thresholds.critical < self.priority_thresholds.high
            || self.priority_thresholds.high < self.priority_thresholds.medium
            || self.priority_thresholds.medium < self.priority_thresholds.low
        {
            return Err(SentinelError::ConfigInvalid(
                "priority thresholds must be descending".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deterministic weighted scorer. Same entry and config always produce the
/// same assessment; there is no clock, randomness, or hidden state.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn priority_for(&self, score: f64) -> Priority {
        let t = &self.config.priority_thresholds;
        if score >= t.critical {
            Priority::Critical
        } else if score >= t.high {
            Priority::High
        } else if score >= t.medium {
            Priority::Medium
        } else if score >= t.low {
            Priority::Low
        } else {
            Priority::Info
        }
    }

    pub fn sla_for(&self, priority: Priority) -> u32 {
        let s = &self.config.sla_hours;
        match priority {
            Priority::Critical => s.critical,
            Priority::High => s.high,
            Priority::Medium => s.medium,
            Priority::Low => s.low,
            Priority::Info => s.info,
        }
    }

    fn severity_component(&self, entry: &FileEntry) -> f64 {
        entry
            .vulnerabilities
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|f| {
                self.config
                    .vulnerability_severity_scores
                    .get(&f.severity)
                    .copied()
                    .unwrap_or(1.0)
            })
            .fold(0.0, f64::max)
    }

    fn category_component(&self, entry: &FileEntry) -> f64 {
        entry
            .category
            .and_then(|c| self.config.file_category_scores.get(&c).copied())
            .unwrap_or(3.0)
    }

    fn relevance_component(&self, entry: &FileEntry) -> f64 {
        entry
            .security_relevance
            .and_then(|r| self.config.security_relevance_scores.get(&r).copied())
            .unwrap_or(2.0)
    }

    fn apply_count_modifier(&self, base: f64, entry: &FileEntry) -> f64 {
        let modifier = &self.config.vulnerability_count;
        if !modifier.enabled {
            return base;
        }
        let findings = entry.vulnerabilities.as_deref().unwrap_or(&[]);
        if findings.len() <= 1 {
            return base;
        }
        let multiplier = (1.0 + (findings.len() as f64 - 1.0) * modifier.base_multiplier)
            .min(modifier.max_multiplier);
        let critical_high = findings
            .iter()
            .filter(|f| matches!(f.severity, Severity::Critical | Severity::High))
            .count();
        let boost = if critical_high >= 2 {
            modifier.critical_high_boost
        } else {
            0.0
        };
        base * multiplier + boost
    }

    /// Score one entry. Entries with no findings still score on category and
    /// relevance (severity component 0).
    pub fn assess(&self, entry: &FileEntry) -> RiskAssessment {
        let severity = self.severity_component(entry);
        let category = self.category_component(entry);
        let relevance = self.relevance_component(entry);

        let weights = &self.config.weights;
        let base = severity * weights.vulnerability_severity
            + category * weights.file_category
            + relevance * weights.security_relevance;
        let score = self.apply_count_modifier(base, entry).clamp(0.0, 10.0);
        let score = (score * 100.0).round() / 100.0;

        let priority = self.priority_for(score);
        let sla_hours = self.sla_for(priority);

        let components = BTreeMap::from([
            ("vulnerability_severity".to_string(), round2(severity)),
            ("file_category".to_string(), round2(category)),
            ("security_relevance".to_string(), round2(relevance)),
            ("base_score".to_string(), round2(base)),
            ("final_score".to_string(), score),
        ]);

        RiskAssessment {
            risk_score: score,
            priority,
            sla_hours,
            components,
            reasoning: self.reasoning(entry),
        }
    }

    fn reasoning(&self, entry: &FileEntry) -> String {
        let findings = entry.vulnerabilities.as_deref().unwrap_or(&[]);
        let mut reasons = Vec::new();

        if findings.is_empty() {
            reasons.push("no scanner findings".to_string());
        } else {
            let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
            for finding in findings {
                *by_severity.entry(finding.severity).or_default() += 1;
            }
            let breakdown = by_severity
                .iter()
                .rev()
                .map(|(severity, count)| format!("{count} {severity:?}").to_lowercase())
                .collect::<Vec<_>>()
                .join(", ");
            reasons.push(format!(
                "{} vulnerabilities found: {breakdown}",
                findings.len()
            ));
        }

        match entry.category {
            Some(
                category @ (FileCategory::Authentication
                | FileCategory::Api
                | FileCategory::DataProcessing),
            ) => {
                let label = serde_json::to_string(&category).unwrap_or_default();
                reasons.push(format!("high-impact {} file", label.trim_matches('"')));
            }
            Some(FileCategory::Config) => reasons.push("system configuration file".to_string()),
            _ => {}
        }

        match entry.security_relevance {
            Some(SecurityRelevance::High) => {
                reasons.push("assessed as high security relevance".to_string())
            }
            Some(SecurityRelevance::Medium) => {
                reasons.push("assessed as medium security relevance".to_string())
            }
            _ => {}
        }

        reasons.join("; ")
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
