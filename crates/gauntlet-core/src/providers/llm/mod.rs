//! Provider adapter capability contract.
//!
//! An adapter wraps one model backend's chat-completion call semantics
//! behind a uniform request/response shape. The engine never standardizes a
//! provider's wire format; adapters own that.

use crate::model::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anthropic;
pub mod openai;

/// Uniform chat-completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

/// Uniform chat-completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

impl ChatResponse {
    /// Single assistant message response, used by adapters whose wire format
    /// has no choice list.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChatChoice {
                message: ChatMessage::assistant(text),
            }],
        }
    }

    /// Primary text content of the response, if any.
    pub fn primary_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Provider-side call failures (network, API error, unusable payload).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} API error (status {status}): {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} response has no message content")]
    MissingContent { provider: &'static str },
}

/// Uniform chat-completion capability. A judge call is just another model
/// call and goes through this same contract.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider identifier used for registry dispatch and
    /// credential resolution.
    fn provider_id(&self) -> &'static str;

    async fn chat(
        &self,
        request: &ChatRequest,
        credential: &str,
    ) -> Result<ChatResponse, ProviderError>;
}
