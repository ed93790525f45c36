pub mod anthropic;
pub mod client;
pub mod ollama;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use ollama::OllamaClient;

use anyhow::Result;

use crate::config::AiConfig;

/// Builds the client named by `[ai] provider`.
pub fn from_config(config: &AiConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicClient::new(config.clone()))),
        "ollama" => Ok(Box::new(OllamaClient::new(config.clone()))),
        other => anyhow::bail!("Unknown ai.provider '{other}'"),
    }
}
