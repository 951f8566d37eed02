use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{parse_classification, prompt, Classification, LlmProvider};
use crate::config::AppConfig;
use crate::error::{Result, SentinelError};

const PROVIDER_NAME: &str = "openai";

/// Hosted chat-completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let api_key = config
            .llm
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                SentinelError::ConfigInvalid(
                    "OpenAI API key missing; set OPENAI_API_KEY or llm.api_key".to_string(),
                )
            })?;
        let settings = config.llm.provider_settings(PROVIDER_NAME)?;
        let http = Client::builder()
            .user_agent("repo-sentinel/0.1")
            .build()
            .map_err(SentinelError::Http)?;
        Ok(Self {
            http,
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_endpoint(mut self, base: &str) -> Self {
        self.url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
        self
    }

    async fn complete(&self, user_prompt: String, max_tokens: u32) -> Result<ChatResponse> {
        let payload = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt::SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(SentinelError::Http)?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(SentinelError::RateLimited {
                service: PROVIDER_NAME.to_string(),
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SentinelError::MalformedResponse(format!(
                "OpenAI API error ({status}): {body}"
            )));
        }

        response.json().await.map_err(SentinelError::Http)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn test_connection(&self) -> Result<()> {
        self.complete("Reply with the JSON object {\"ok\": true}".to_string(), 10)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, content))]
    async fn classify(&self, path: &str, extension: &str, content: &str) -> Result<Classification> {
        let user_prompt = prompt::analysis_prompt(path, extension, content);
        let chat = self.complete(user_prompt, self.max_tokens).await?;

        let reply = chat
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| {
                SentinelError::MalformedResponse("OpenAI reply missing message content".to_string())
            })?;

        let mut classification = parse_classification(&reply, PROVIDER_NAME, &self.model)?;
        if let Some(usage) = chat.usage {
            classification.input_tokens = Some(usage.prompt_tokens);
            classification.output_tokens = Some(usage.completion_tokens);
        }
        debug!(category = ?classification.category, "file classified");
        Ok(classification)
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
