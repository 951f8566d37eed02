use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::{Result, SentinelError};
use crate::manifest::{FileCategory, SecurityRelevance};

mod bedrock;
mod openai;
pub mod prompt;

pub use bedrock::BedrockProvider;
pub use openai::OpenAiProvider;

/// Classifier output for one file, tagged with the provider that produced it.
#[derive(Debug, Clone)]
pub struct Classification {
    pub purpose: String,
    pub category: FileCategory,
    pub confidence: f64,
    pub security_relevance: SecurityRelevance,
    pub reasoning: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl Classification {
    /// Placeholder recorded when a file's analysis keeps failing. The phase
    /// continues; the failure stays visible in the manifest.
    pub fn analysis_failed(provider: &str, model: &str, reason: &str) -> Self {
        Self {
            purpose: "Could not analyze file purpose".to_string(),
            category: FileCategory::Other,
            confidence: 0.0,
            security_relevance: SecurityRelevance::Low,
            reasoning: format!("analysis_failed:{reason}"),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.reasoning.starts_with("analysis_failed:")
    }
}

/// One concrete LLM backend. Provider-specific auth, throttling detection,
/// and region routing stay behind this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Cheap end-to-end probe of credentials and reachability.
    async fn test_connection(&self) -> Result<()>;

    /// Classify one file. `content` is already clipped to the provider's
    /// input budget.
    async fn classify(&self, path: &str, extension: &str, content: &str) -> Result<Classification>;
}

/// Registry keyed by provider name.
pub async fn build_provider(name: &str, config: &AppConfig) -> Result<Arc<dyn LlmProvider>> {
    match name {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "bedrock" => Ok(Arc::new(BedrockProvider::new(config).await?)),
        other => Err(SentinelError::ConfigInvalid(format!(
            "unsupported LLM provider `{other}`"
        ))),
    }
}

#[derive(Deserialize)]
struct WireClassification {
    purpose: String,
    category: FileCategory,
    confidence: f64,
    security_relevance: SecurityRelevance,
    #[serde(default)]
    reasoning: String,
}

/// Parse the strict-JSON classification out of a model reply. Locates the
/// first JSON object in the text (models occasionally wrap the object in
/// prose or fences), validates the required keys and enum domains, and
/// clamps confidence into [0, 1].
pub fn parse_classification(
    reply: &str,
    provider: &str,
    model: &str,
) -> Result<Classification> {
    let start = reply
        .find('{')
        .ok_or_else(|| SentinelError::MalformedResponse("no JSON object in reply".to_string()))?;
    let end = reply
        .rfind('}')
        .ok_or_else(|| SentinelError::MalformedResponse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(SentinelError::MalformedResponse(
            "unterminated JSON object".to_string(),
        ));
    }

    let wire: WireClassification = serde_json::from_str(&reply[start..=end])
        .map_err(|err| SentinelError::MalformedResponse(err.to_string()))?;

    Ok(Classification {
        purpose: wire.purpose,
        category: wire.category,
        confidence: wire.confidence.clamp(0.0, 1.0),
        security_relevance: wire.security_relevance,
        reasoning: wire.reasoning,
        provider: provider.to_string(),
        model: model.to_string(),
        input_tokens: None,
        output_tokens: None,
    })
}
