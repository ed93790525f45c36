//! Ollama API provider.
//!
//! Calls `POST {host}/api/chat` with an Ollama-native request format.
//!
//! Key differences from Anthropic:
//! - System prompt is sent as a `role: "system"` message (not a top-level field).
//! - Token usage: `prompt_eval_count` / `eval_count` (may be absent).
//! - Must set `stream: false` for synchronous responses.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::{http_client, LlmClient, LlmResponse};
use crate::config::AiConfig;

/// Default Ollama API base URL.
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Ollama `/api/chat` request body.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama generation options.
#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    /// Deterministic output for command translation
    temperature: f32,
}

/// Ollama `/api/chat` response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// Client for the Ollama API.
pub struct OllamaClient {
    client: Client,
    config: AiConfig,
    host: String,
}

impl OllamaClient {
    /// Creates a new Ollama client from configuration.
    ///
    /// If `config.host` is `None`, defaults to `http://localhost:11434`.
    pub fn new(config: AiConfig) -> Self {
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
        // Strip trailing slash for consistent URL construction
        let host = host.trim_end_matches('/').to_string();
        let client = http_client(Duration::from_millis(config.timeout_ms));
        Self {
            client,
            config,
            host,
        }
    }

    fn build_request(&self, system_prompt: &str, user_text: &str) -> OllamaChatRequest {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        messages.push(OllamaMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        });

        OllamaChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: false,
            options: OllamaOptions {
                num_predict: self.config.max_tokens,
                temperature: 0.0,
            },
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<LlmResponse> {
        let request = self.build_request(system_prompt, user_text);
        let url = format!("{}/api/chat", self.host);

        debug!("Calling Ollama API ({}) at {url}", self.config.model);

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({status}): {body}");
        }

        let resp: OllamaChatResponse = response.json().await?;

        let input_tokens = resp.prompt_eval_count.unwrap_or(0);
        let output_tokens = resp.eval_count.unwrap_or(0);

        info!("LLM response: {input_tokens} in / {output_tokens} out tokens");

        Ok(LlmResponse {
            text: resp.message.content,
            input_tokens,
            output_tokens,
        })
    }

    fn description(&self) -> String {
        self.config.description()
    }
}
