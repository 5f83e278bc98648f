//! Data-driven provider dispatch.
//!
//! New providers register by identifier; nothing in the engine branches on
//! model names. An unrecognized provider identifier resolves to the default
//! adapter with a logged warning instead of failing the step.

use super::llm::anthropic::AnthropicChat;
use super::llm::openai::OpenAiChat;
use super::llm::ChatProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn ChatProvider>>,
    default: Arc<dyn ChatProvider>,
}

impl ProviderRegistry {
    /// Registry with only the given default adapter.
    pub fn new(default: Arc<dyn ChatProvider>) -> Self {
        let mut adapters: HashMap<&'static str, Arc<dyn ChatProvider>> = HashMap::new();
        adapters.insert(default.provider_id(), default.clone());
        Self { adapters, default }
    }

    /// Registry with the built-in adapters; the OpenAI-format adapter is the
    /// default fallback.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new(Arc::new(OpenAiChat::new()));
        registry.register(Arc::new(AnthropicChat::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChatProvider>) {
        self.adapters.insert(adapter.provider_id(), adapter);
    }

    /// Resolve an adapter by provider identifier, falling back to the
    /// default adapter for unknown identifiers.
    pub fn resolve(&self, provider_id: &str) -> Arc<dyn ChatProvider> {
        match self.adapters.get(provider_id) {
            Some(adapter) => adapter.clone(),
            None => {
                warn!(
                    provider = provider_id,
                    fallback = self.default.provider_id(),
                    "unknown provider identifier, using default adapter"
                );
                self.default.clone()
            }
        }
    }
}
