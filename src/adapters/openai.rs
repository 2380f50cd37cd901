//! OpenAI-compatible chat completions provider.
//!
//! Endpoint: POST {base_url}/chat/completions
//! Auth: Bearer token
//!
//! Requests JSON output via `response_format`; the schema itself is
//! enforced by `llm::schema`, not by the provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Completion, LlmProvider, ProviderError};
use crate::config::LlmConfig;

pub struct OpenAiProvider {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_output_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(settings: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_output_tokens: settings.max_output_tokens,
            client,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_schema: &Value,
    ) -> Result<Completion, ProviderError> {
        // The schema travels in the system message; json_object mode only guarantees syntax
        let system = format!("{}\n\nResponse schema:\n{}", system_prompt, json_schema);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_output_tokens,
            response_format: serde_json::json!({ "type": "json_object" }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map(|secs| (secs * 1000.0) as u64);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("{}: {}", status, text);
            return Err(if status.is_server_error() {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable response body: {}", e)))?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Transient("response has no content".to_string()))?;

        Ok(Completion {
            text,
            tokens_in: body.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: body.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_settings() {
        let settings = LlmConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        let provider = OpenAiProvider::new(&settings, "key".to_string()).unwrap();
        assert_eq!(provider.endpoint, "http://localhost:8080/v1/chat/completions");
        assert_eq!(provider.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"suggestions\":[]}"}}],
                      "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{\"suggestions\":[]}"));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 12);
    }
}
