use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::{http_client, LlmClient, LlmResponse};
use crate::config::AiConfig;

const DEFAULT_ANTHROPIC_HOST: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for Anthropic Messages API
pub struct AnthropicClient {
    client: Client,
    config: AiConfig,
    host: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicClient {
    pub fn new(config: AiConfig) -> Self {
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_HOST.to_string())
            .trim_end_matches('/')
            .to_string();
        let client = http_client(Duration::from_millis(config.timeout_ms));
        Self {
            client,
            config,
            host,
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<LlmResponse> {
        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: system_prompt.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: user_text.to_string(),
            }],
        };

        debug!("Calling Claude API ({})", self.config.model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.host))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error ({status}): {body}");
        }

        let resp: MessagesResponse = response.json().await?;
        Ok(into_llm_response(resp))
    }

    fn description(&self) -> String {
        self.config.description()
    }
}

fn into_llm_response(resp: MessagesResponse) -> LlmResponse {
    let text = resp
        .content
        .iter()
        .filter_map(|block| {
            if block.block_type == "text" {
                block.text.clone()
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let (input_tokens, output_tokens) = resp
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));

    info!("LLM response: {input_tokens} in / {output_tokens} out tokens");

    LlmResponse {
        text,
        input_tokens,
        output_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: Option<&str>) -> AiConfig {
        AiConfig {
            provider: "anthropic".to_string(),
            model: "claude-haiku-4-5".to_string(),
            api_key: "test-key".to_string(),
            host: host.map(String::from),
            timeout_ms: 5_000,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_description() {
        let client = AnthropicClient::new(config(None));
        assert_eq!(client.description(), "anthropic (claude-haiku-4-5)");
    }

    #[test]
    fn test_host_override_strips_trailing_slash() {
        assert_eq!(AnthropicClient::new(config(None)).host, DEFAULT_ANTHROPIC_HOST);
        let client = AnthropicClient::new(config(Some("http://proxy.local:8080/")));
        assert_eq!(client.host, "http://proxy.local:8080");
    }

    #[test]
    fn test_request_serialization() {
        let request = MessagesRequest {
            model: "m".to_string(),
            max_tokens: 64,
            system: "sys".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "list files".to_string(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"], "sys");
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "list files");
    }

    #[test]
    fn test_response_text_blocks_are_joined() {
        let resp: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "ls -la"},
                {"type": "tool_use", "id": "x", "name": "y", "input": {}},
            ],
            "usage": {"input_tokens": 120, "output_tokens": 4}
        }))
        .unwrap();
        let llm = into_llm_response(resp);
        assert_eq!(llm.text, "ls -la");
        assert_eq!(llm.input_tokens, 120);
        assert_eq!(llm.output_tokens, 4);
    }

    #[test]
    fn test_response_without_usage() {
        let resp: MessagesResponse =
            serde_json::from_value(serde_json::json!({"content": []})).unwrap();
        let llm = into_llm_response(resp);
        assert_eq!(llm.text, "");
        assert_eq!((llm.input_tokens, llm.output_tokens), (0, 0));
    }
}
