//! `LlmClient` trait, the seam between the translator and LLM backends.
//!
//! Providers (Anthropic, Ollama) implement this trait so the translator
//! can be configured to use any supported backend via the
//! `[ai] provider` config field.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Text answer plus token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A single-turn completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one user turn under `system_prompt` and returns the answer text.
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<LlmResponse>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in startup logs, e.g. `"anthropic (claude-haiku-4-5)"`.
    fn description(&self) -> String;
}

/// HTTP client with the request timeout applied at the transport level too.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
