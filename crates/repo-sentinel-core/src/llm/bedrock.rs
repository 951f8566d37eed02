use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{parse_classification, prompt, Classification, LlmProvider};
use crate::config::AppConfig;
use crate::error::{Result, SentinelError};

const PROVIDER_NAME: &str = "bedrock";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Regional model-inference provider (AWS Bedrock, Anthropic messages
/// payload). Credentials come from the configured profile; region routing
/// stays inside this type.
#[derive(Debug, Clone)]
pub struct BedrockProvider {
    client: Client,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl BedrockProvider {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let secondary = &config.secondary_provider;
        let settings = config.llm.provider_settings(PROVIDER_NAME)?;

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .profile_name(&secondary.credential_profile)
            .region(Region::new(secondary.region.clone()))
            .load()
            .await;
        let client = Client::new(&shared);

        let model = if settings.model.is_empty() {
            secondary.model.clone()
        } else {
            settings.model.clone()
        };

        Ok(Self {
            client,
            model,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }

    async fn invoke(&self, user_prompt: String, max_tokens: u32) -> Result<String> {
        let payload = AnthropicRequest {
            anthropic_version: ANTHROPIC_VERSION,
            max_tokens,
            temperature: self.temperature,
            system: prompt::SYSTEM_PROMPT,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContent {
                    kind: "text",
                    text: user_prompt,
                }],
            }],
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|err| SentinelError::MalformedResponse(err.to_string()))?;

        let outcome = self
            .client
            .invoke_model()
            .model_id(&self.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_throttling_exception() {
                    return Err(SentinelError::RateLimited {
                        service: PROVIDER_NAME.to_string(),
                    });
                }
                return Err(SentinelError::MalformedResponse(format!(
                    "Bedrock invoke_model failed: {service_err}"
                )));
            }
        };

        let reply: AnthropicResponse = serde_json::from_slice(response.body().as_ref())
            .map_err(|err| SentinelError::MalformedResponse(err.to_string()))?;
        reply
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| {
                SentinelError::MalformedResponse("Bedrock reply missing text content".to_string())
            })
    }
}

#[async_trait]
impl LlmProvider for BedrockProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn test_connection(&self) -> Result<()> {
        self.invoke("Reply with the JSON object {\"ok\": true}".to_string(), 10)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, content))]
    async fn classify(&self, path: &str, extension: &str, content: &str) -> Result<Classification> {
        let user_prompt = prompt::analysis_prompt(path, extension, content);
        let reply = self.invoke(user_prompt, self.max_tokens).await?;
        let classification = parse_classification(&reply, PROVIDER_NAME, &self.model)?;
        debug!(category = ?classification.category, "file classified");
        Ok(classification)
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    anthropic_version: &'static str,
    max_tokens: u32,
    temperature: f32,
    system: &'static str,
    messages: Vec<AnthropicMessage>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContent>,
}

#[derive(Serialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicReplyPart>,
}

#[derive(Deserialize)]
struct AnthropicReplyPart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_matches_wire_contract() {
        let payload = AnthropicRequest {
            anthropic_version: ANTHROPIC_VERSION,
            max_tokens: 1000,
            temperature: 0.1,
            system: prompt::SYSTEM_PROMPT,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContent {
                    kind: "text",
                    text: "hello".to_string(),
                }],
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn reply_text_extraction_skips_non_text_parts() {
        let reply: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"tool_use"},{"type":"text","text":"{}"}]}"#,
        )
        .unwrap();
        let text = reply.content.into_iter().find_map(|p| p.text);
        assert_eq!(text.as_deref(), Some("{}"));
    }
}
