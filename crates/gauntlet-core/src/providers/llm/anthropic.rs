//! Anthropic messages-format adapter.
//!
//! The wire format differs from the OpenAI shape in three ways that matter
//! here: system messages travel in a top-level `system` field, `max_tokens`
//! is mandatory, and the reply is a list of content blocks instead of a
//! choice list.

use super::{ChatProvider, ChatRequest, ChatResponse, ProviderError};
use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicChat {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicChat {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for AnthropicChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for AnthropicChat {
    fn provider_id(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        credential: &str,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);

        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for msg in &request.messages {
            if msg.role == "system" {
                system_parts.push(msg.content.clone());
            } else {
                messages.push(json!({ "role": msg.role, "content": msg.content }));
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", credential)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: "anthropic",
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: "anthropic",
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value =
            resp.json().await.map_err(|source| ProviderError::Transport {
                provider: "anthropic",
                source,
            })?;

        let text = value
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingContent {
                provider: "anthropic",
            })?;

        Ok(ChatResponse::from_text(text))
    }
}
