//! OpenAI-format chat completions adapter.

use super::{ChatProvider, ChatRequest, ChatResponse, ProviderError};
use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiChat {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the adapter at a compatible endpoint (proxies, test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenAiChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    fn provider_id(&self) -> &'static str {
        "openai"
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        credential: &str,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: "openai",
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: "openai",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse =
            resp.json().await.map_err(|source| ProviderError::Transport {
                provider: "openai",
                source,
            })?;
        if parsed.primary_text().is_none() {
            return Err(ProviderError::MissingContent { provider: "openai" });
        }
        Ok(parsed)
    }
}
