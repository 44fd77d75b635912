//! Capstan LLM - provider trait, wire types, and dialect adapters

pub mod anthropic;
pub mod openai;
pub mod provider;
pub mod testing;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use provider::{complete_stream_with_retry, LlmProvider, LlmResult, LlmStream};
pub use types::{
    normalize_messages, AccumulatedToolCall, ContentBlock, LlmContent, LlmMessage, LlmRequest,
    LlmTool, StreamDelta,
};

use capstan_core::{ConfigError, ModelConfig};
use std::sync::Arc;

/// Resolve the configured provider dialect to a concrete adapter.
/// Must run after `CapstanConfig::validate()`.
pub fn provider_for_config(config: &ModelConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    match config.provider.as_str() {
        "anthropic" => {
            let mut p = AnthropicProvider::new(&config.api_key);
            if let Some(ref url) = config.base_url {
                p = p.with_base_url(url.clone());
            }
            Ok(Arc::new(p))
        }
        "openai" => {
            let mut p = OpenAiProvider::new(&config.api_key);
            if let Some(ref url) = config.base_url {
                p = p.with_base_url(url.clone());
            }
            Ok(Arc::new(p))
        }
        "gemini" => {
            let base_url = config
                .base_url
                .clone()
                .ok_or(ConfigError::MissingOption("model.baseURL"))?;
            Ok(Arc::new(OpenAiProvider::gemini(&config.api_key, base_url)))
        }
        other => Err(ConfigError::UnknownProvider(other.to_string())),
    }
}
