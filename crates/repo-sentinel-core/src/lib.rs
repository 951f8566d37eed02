pub mod analyzer;
pub mod config;
pub mod error;
pub mod llm;
pub mod manifest;
pub mod phase;
pub mod report;
pub mod risk;
pub mod scanner;
pub mod source;
pub mod testing;
pub mod tokens;

pub use analyzer::{AnalyzerOptions, CostPreview, EnrichmentSummary, LlmAnalyzer};
pub use config::AppConfig;
pub use error::{Result, SentinelError};
pub use llm::{build_provider, Classification, LlmProvider};
pub use manifest::{
    EntryPatch, FileCategory, FileEntry, Finding, InventoryRecord, Manifest, ManifestStore,
    Priority, RepositoryInfo, RiskAssessment, SecurityRelevance, Severity, TokenStats,
};
pub use phase::{Phase, PhaseController};
pub use report::{render_summary, write_token_report};
pub use risk::{RiskConfig, RiskScorer};
pub use scanner::{build_scanner, ScannerRunner, VulnScanner};
pub use source::{GithubSource, RepoSource};
pub use tokens::{default_encoder, RepoTokenStats, TokenAccountant, TokenEncoder};
