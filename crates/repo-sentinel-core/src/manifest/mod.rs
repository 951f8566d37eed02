use serde::{Deserialize, Serialize};

pub mod store;

pub use store::ManifestStore;

/// Functional category assigned by the LLM classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileCategory {
    Authentication,
    DataProcessing,
    Api,
    Frontend,
    Config,
    Test,
    Build,
    Documentation,
    Other,
}

/// LLM-assessed security relevance of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityRelevance {
    Low,
    Medium,
    High,
}

/// Canonical finding severity; scanner-native taxonomies are mapped onto this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Remediation priority derived from the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// One normalized vulnerability report, scoped to a path and line range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub scanner_name: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// Token accounting for one file's analysis prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub content_tokens: u64,
    pub prompt_tokens: u64,
    pub estimated_response_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    /// True when the length-based estimator stood in for the real encoder.
    #[serde(default)]
    pub approximate: bool,
}

/// Computed score/priority/SLA triple plus the component breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub priority: Priority,
    pub sla_hours: u32,
    pub components: std::collections::BTreeMap<String, f64>,
    pub reasoning: String,
}

/// One record per analyzed file. Fields accumulate across phases; any
/// enrichment field may be absent until its owning phase has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub blob_id: String,
    pub size: u64,
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FileCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_relevance: Option<SecurityRelevance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_stats: Option<TokenStats>,
    /// `Some(vec![])` means scanned with no findings; `None` means not scanned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<Vec<Finding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
}

impl FileEntry {
    pub fn new(path: String, blob_id: String, size: u64, extension: String) -> Self {
        Self {
            path,
            blob_id,
            size,
            extension,
            purpose: None,
            category: None,
            confidence: None,
            security_relevance: None,
            reasoning: None,
            provider: None,
            model: None,
            token_stats: None,
            vulnerabilities: None,
            risk_assessment: None,
        }
    }
}

/// Provenance identity of the analyzed repository, pinned on first write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub url: String,
    pub default_branch: String,
    pub commit_sha: String,
    pub analysis_timestamp: String,
}

/// File inventory record produced by the source adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    pub path: String,
    pub blob_id: String,
    pub size: u64,
    pub extension: String,
}

/// Field group one enrichment pass produces for one file. Only the groups
/// present overwrite; everything else on the entry is left alone.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub classification: Option<crate::llm::Classification>,
    pub token_stats: Option<TokenStats>,
    pub vulnerabilities: Option<Vec<Finding>>,
    pub risk_assessment: Option<RiskAssessment>,
}

/// The single JSON document describing one repository analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub repository: RepositoryInfo,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn new(repository: RepositoryInfo) -> Self {
        Self {
            repository,
            files: Vec::new(),
        }
    }

    pub fn entry(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn entry_mut(&mut self, path: &str) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    /// Merge a fresh inventory listing. Existing entries keep their position
    /// and enrichment fields and only have identity fields refreshed; unseen
    /// paths are appended in listing order. Entries whose path no longer
    /// appears in the listing are retained untouched.
    pub fn merge_inventory(&mut self, records: Vec<InventoryRecord>) {
        for record in records {
            match self.entry_mut(&record.path) {
                Some(existing) => {
                    existing.blob_id = record.blob_id;
                    existing.size = record.size;
                    existing.extension = record.extension;
                }
                None => {
                    self.files.push(FileEntry::new(
                        record.path,
                        record.blob_id,
                        record.size,
                        record.extension,
                    ));
                }
            }
        }
    }

    /// Merge one enrichment patch into the entry for `path`. Patches for
    /// unknown paths are dropped: the manifest is the ground truth of what
    /// is tracked.
    pub fn merge_patch(&mut self, path: &str, patch: EntryPatch) {
        let Some(entry) = self.entry_mut(path) else {
            return;
        };
        if let Some(classification) = patch.classification {
            entry.purpose = Some(classification.purpose);
            entry.category = Some(classification.category);
            entry.confidence = Some(classification.confidence);
            entry.security_relevance = Some(classification.security_relevance);
            entry.reasoning = Some(classification.reasoning);
            entry.provider = Some(classification.provider);
            entry.model = Some(classification.model);
        }
        if let Some(token_stats) = patch.token_stats {
            entry.token_stats = Some(token_stats);
        }
        if let Some(vulnerabilities) = patch.vulnerabilities {
            entry.vulnerabilities = Some(vulnerabilities);
        }
        if let Some(risk) = patch.risk_assessment {
            entry.risk_assessment = Some(risk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Classification;
    use proptest::prelude::*;

    fn repo_info() -> RepositoryInfo {
        RepositoryInfo {
            url: "https://github.com/acme/widgets".into(),
            default_branch: "main".into(),
            commit_sha: "0123abcd".into(),
            analysis_timestamp: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn record(path: &str) -> InventoryRecord {
        InventoryRecord {
            path: path.into(),
            blob_id: format!("blob-{path}"),
            size: 100,
            extension: ".py".into(),
        }
    }

    #[test]
    fn inventory_appends_new_entries_in_order() {
        let mut manifest = Manifest::new(repo_info());
        manifest.merge_inventory(vec![record("a.py"), record("b.py"), record("c.py")]);
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn inventory_refresh_keeps_enrichment_and_position() {
        let mut manifest = Manifest::new(repo_info());
        manifest.merge_inventory(vec![record("a.py"), record("b.py")]);
        manifest.entry_mut("a.py").unwrap().purpose = Some("auth module".into());

        let mut updated = record("a.py");
        updated.blob_id = "blob-v2".into();
        updated.size = 250;
        manifest.merge_inventory(vec![updated, record("c.py")]);

        let a = manifest.entry("a.py").unwrap();
        assert_eq!(a.blob_id, "blob-v2");
        assert_eq!(a.size, 250);
        assert_eq!(a.purpose.as_deref(), Some("auth module"));
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn orphan_entries_are_retained() {
        let mut manifest = Manifest::new(repo_info());
        manifest.merge_inventory(vec![record("gone.py"), record("kept.py")]);
        manifest.merge_inventory(vec![record("kept.py")]);
        assert!(manifest.entry("gone.py").is_some());
    }

    #[test]
    fn patch_overwrites_only_present_groups() {
        let mut manifest = Manifest::new(repo_info());
        manifest.merge_inventory(vec![record("a.py")]);
        manifest.merge_patch(
            "a.py",
            EntryPatch {
                classification: Some(Classification {
                    purpose: "login handler".into(),
                    category: FileCategory::Authentication,
                    confidence: 0.9,
                    security_relevance: SecurityRelevance::High,
                    reasoning: "handles credentials".into(),
                    provider: "openai".into(),
                    model: "gpt-4o-mini".into(),
                    input_tokens: None,
                    output_tokens: None,
                }),
                ..Default::default()
            },
        );
        manifest.merge_patch(
            "a.py",
            EntryPatch {
                vulnerabilities: Some(vec![]),
                ..Default::default()
            },
        );

        let a = manifest.entry("a.py").unwrap();
        assert_eq!(a.category, Some(FileCategory::Authentication));
        assert_eq!(a.vulnerabilities.as_deref(), Some(&[][..]));
    }

    #[test]
    fn patch_for_unknown_path_is_dropped() {
        let mut manifest = Manifest::new(repo_info());
        manifest.merge_patch(
            "nope.py",
            EntryPatch {
                vulnerabilities: Some(vec![]),
                ..Default::default()
            },
        );
        assert!(manifest.files.is_empty());
    }

    #[test]
    fn empty_vulnerabilities_serializes_as_empty_list() {
        let mut entry = FileEntry::new("a.py".into(), "b".into(), 1, ".py".into());
        entry.vulnerabilities = Some(vec![]);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["vulnerabilities"], serde_json::json!([]));

        let bare = FileEntry::new("a.py".into(), "b".into(), 1, ".py".into());
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("vulnerabilities").is_none());
    }

    #[test]
    fn severity_orders_by_badness() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn category_round_trips_kebab_case() {
        let json = serde_json::to_string(&FileCategory::DataProcessing).unwrap();
        assert_eq!(json, "\"data-processing\"");
        let parsed: FileCategory = serde_json::from_str("\"data-processing\"").unwrap();
        assert_eq!(parsed, FileCategory::DataProcessing);
    }

    proptest! {
        #[test]
        fn inventory_merge_preserves_first_seen_order(
            first in proptest::collection::vec("[a-z]{1,8}", 1..20),
            second in proptest::collection::vec("[a-z]{1,8}", 1..20),
        ) {
            let mut manifest = Manifest::new(repo_info());
            let to_records = |names: &[String]| {
                names
                    .iter()
                    .map(|n| record(&format!("{n}.py")))
                    .collect::<Vec<_>>()
            };
            manifest.merge_inventory(to_records(&first));
            let order_before: Vec<_> =
                manifest.files.iter().map(|f| f.path.clone()).collect();
            manifest.merge_inventory(to_records(&second));
            let order_after: Vec<_> =
                manifest.files.iter().map(|f| f.path.clone()).collect();

            // previously known paths keep their relative order
            prop_assert_eq!(
                &order_after[..order_before.len()],
                &order_before[..]
            );
            // no duplicates appear
            let mut deduped = order_after.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), order_after.len());
        }
    }
}
