use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};
use crate::risk::RiskConfig;

/// Source-control API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub api_base: String,
    pub token: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

/// Secondary (regional model-inference) provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryProviderConfig {
    pub region: String,
    pub model: String,
    pub credential_profile: String,
}

impl Default for SecondaryProviderConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            model: "anthropic.claude-3-5-sonnet-20240620-v1:0".to_string(),
            credential_profile: "default".to_string(),
        }
    }
}

/// Candidate filtering and worker sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub file_extensions: Vec<String>,
    pub max_file_size: u64,
    /// Bounded-concurrency worker count for the classification loop.
    pub batch_size: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            file_extensions: [
                ".py", ".js", ".java", ".go", ".rb", ".php", ".ts", ".jsx", ".tsx", ".rs",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: 1_048_576,
            batch_size: 4,
        }
    }
}

/// Per-provider model and pricing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub input_rate_per_1k: f64,
    pub output_rate_per_1k: f64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 1000,
            temperature: 0.1,
            input_rate_per_1k: 0.003,
            output_rate_per_1k: 0.015,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub default_provider: String,
    pub openai: ProviderSettings,
    pub bedrock: ProviderSettings,
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            openai: ProviderSettings {
                model: "gpt-4o-mini".to_string(),
                input_rate_per_1k: 0.000_15,
                output_rate_per_1k: 0.000_6,
                ..ProviderSettings::default()
            },
            bedrock: ProviderSettings {
                model: "anthropic.claude-3-5-sonnet-20240620-v1:0".to_string(),
                ..ProviderSettings::default()
            },
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn provider_settings(&self, provider: &str) -> Result<&ProviderSettings> {
        match provider {
            "openai" => Ok(&self.openai),
            "bedrock" => Ok(&self.bedrock),
            other => Err(SentinelError::ConfigInvalid(format!(
                "unknown LLM provider `{other}`"
            ))),
        }
    }

    /// The secondary provider used when the primary is exhausted.
    pub fn fallback_for(&self, provider: &str) -> Option<&'static str> {
        match provider {
            "openai" => Some("bedrock"),
            "bedrock" => Some("openai"),
            _ => None,
        }
    }
}

/// One scanner's invocation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub exclude_patterns: Vec<String>,
    pub confidence_level: Option<String>,
    pub severity_level: Option<String>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 120,
            exclude_patterns: vec![
                "tests/".to_string(),
                "node_modules/".to_string(),
                "*.min.js".to_string(),
            ],
            confidence_level: None,
            severity_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnScanConfig {
    pub scanners: BTreeMap<String, ScannerSettings>,
    pub auto_install: bool,
    pub max_findings_per_file: usize,
}

impl Default for VulnScanConfig {
    fn default() -> Self {
        let mut scanners = BTreeMap::new();
        scanners.insert("semgrep".to_string(), ScannerSettings::default());
        scanners.insert("bandit".to_string(), ScannerSettings::default());
        Self {
            scanners,
            auto_install: false,
            max_findings_per_file: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub default_dir: String,
    pub manifest_filename: String,
    pub token_analysis_filename: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_dir: "analysis-results".to_string(),
            manifest_filename: "manifest.json".to_string(),
            token_analysis_filename: "token_analysis.json".to_string(),
        }
    }
}

/// Root configuration. Deserialized once at startup, validated, then passed
/// by value into components. Environment variables override file values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub secondary_provider: SecondaryProviderConfig,
    pub analysis: AnalysisConfig,
    pub llm: LlmConfig,
    pub vulnerability_scanning: VulnScanConfig,
    pub risk_scoring: RiskConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides, then validate. Precedence: env > config file > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(SentinelError::ConfigInvalid(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        let raw = builder
            .build()
            .map_err(|err| SentinelError::ConfigInvalid(err.to_string()))?;
        let mut cfg: AppConfig = raw
            .try_deserialize()
            .map_err(|err| SentinelError::ConfigInvalid(err.to_string()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                self.source.token = Some(token.trim().to_string());
            }
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(profile) = env::var("AWS_PROFILE") {
            if !profile.trim().is_empty() {
                self.secondary_provider.credential_profile = profile.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.risk_scoring.validate()?;
        if self.analysis.batch_size == 0 {
            return Err(SentinelError::ConfigInvalid(
                "analysis.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.analysis.max_file_size == 0 {
            return Err(SentinelError::ConfigInvalid(
                "analysis.max_file_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a manifest entry passes the extension whitelist and size cap.
    pub fn is_analyzable(&self, extension: &str, size: u64) -> bool {
        self.analysis
            .file_extensions
            .iter()
            .any(|ext| ext == extension)
            && size <= self.analysis.max_file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn missing_config_file_is_config_invalid() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/sentinel.yaml"))).unwrap_err();
        assert!(matches!(err, SentinelError::ConfigInvalid(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.yaml");
        fs::write(
            &path,
            "analysis:\n  batch_size: 8\n  max_file_size: 2048\noutput:\n  default_dir: out\n",
        )
        .unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.analysis.batch_size, 8);
        assert_eq!(cfg.analysis.max_file_size, 2048);
        assert_eq!(cfg.output.default_dir, "out");
        // untouched sections keep defaults
        assert_eq!(cfg.llm.default_provider, "openai");
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = AppConfig::default();
        cfg.analysis.batch_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(SentinelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn analyzable_respects_whitelist_and_size() {
        let cfg = AppConfig::default();
        assert!(cfg.is_analyzable(".py", 100));
        assert!(!cfg.is_analyzable(".md", 100));
        assert!(!cfg.is_analyzable(".py", cfg.analysis.max_file_size + 1));
    }

    #[test]
    fn unknown_provider_rejected() {
        let cfg = AppConfig::default();
        assert!(cfg.llm.provider_settings("claude-desktop").is_err());
        assert!(cfg.llm.provider_settings("openai").is_ok());
    }
}
