use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Natural-language translation backend. Without it every
    /// natural-language request is answered with `AiUnavailable`.
    #[serde(default)]
    pub ai: Option<AiConfig>,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Directory every command runs in and every path argument must stay inside
    pub sandbox_root: PathBuf,
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_confidence_threshold")]
    pub ai_confidence_threshold: f64,
    /// Extra program names refused on top of the built-in table
    #[serde(default)]
    pub denied_commands: Vec<String>,
    /// Extra regex rules (case-insensitive) refused on top of the built-in table
    #[serde(default)]
    pub denied_patterns: Vec<String>,
    /// Extra program names the classifier treats as literal commands
    #[serde(default)]
    pub known_commands: Vec<String>,
    /// Client identities refused before any other processing
    #[serde(default)]
    pub blocked_clients: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: String,
    /// Base URL override (Ollama host, Anthropic-compatible proxy)
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_ai_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_command_length() -> usize {
    1000
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_max_output_bytes() -> usize {
    10 * 1024
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    100
}

fn default_idle_eviction_secs() -> u64 {
    600
}

fn default_ai_timeout_ms() -> u64 {
    8_000
}

fn default_max_tokens() -> u32 {
    256
}

fn default_history_path() -> PathBuf {
    PathBuf::from("./data/history.jsonl")
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

impl AiConfig {
    /// Human-readable description of the backend, e.g. `"ollama (llama3.2)"`
    pub fn description(&self) -> String {
        format!("{} ({})", self.provider, self.model)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the pipeline unusable or unsafe.
    pub fn validate(&self) -> anyhow::Result<()> {
        let policy = &self.policy;
        if !(0.0..=1.0).contains(&policy.ai_confidence_threshold) {
            anyhow::bail!(
                "policy.ai_confidence_threshold must be within [0, 1], got {}",
                policy.ai_confidence_threshold
            );
        }
        if policy.max_command_length == 0 {
            anyhow::bail!("policy.max_command_length must be greater than zero");
        }
        if policy.command_timeout_ms == 0 {
            anyhow::bail!("policy.command_timeout_ms must be greater than zero");
        }
        if policy.max_output_bytes == 0 {
            anyhow::bail!("policy.max_output_bytes must be greater than zero");
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.window_secs and rate_limit.max_requests must be greater than zero");
        }

        if let Some(ref ai) = self.ai {
            match ai.provider.as_str() {
                "anthropic" | "ollama" => {}
                other => anyhow::bail!("Unknown ai.provider '{other}' (expected anthropic or ollama)"),
            }
            if ai.timeout_ms == 0 {
                anyhow::bail!("ai.timeout_ms must be greater than zero");
            }
            if let Some(ref host) = ai.host {
                let parsed = url::Url::parse(host)
                    .map_err(|e| anyhow::anyhow!("Invalid ai.host '{host}': {e}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    anyhow::bail!("ai.host must use http or https, got '{}'", parsed.scheme());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
port = 7878

[policy]
sandbox_root = "/tmp/sandbox"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.policy.max_command_length, 1000);
        assert_eq!(config.policy.command_timeout_ms, 10_000);
        assert_eq!(config.policy.max_output_bytes, 10 * 1024);
        assert_eq!(config.policy.ai_confidence_threshold, 0.7);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert!(config.ai.is_none());
        assert_eq!(config.history.path, PathBuf::from("./data/history.jsonl"));
    }

    #[test]
    fn test_ai_section() {
        let content = format!(
            "{MINIMAL}\n[ai]\nprovider = \"ollama\"\nmodel = \"llama3.2\"\nhost = \"http://gpu-box:11434\"\n"
        );
        let config = Config::parse(&content).unwrap();
        let ai = config.ai.unwrap();
        assert_eq!(ai.description(), "ollama (llama3.2)");
        assert_eq!(ai.timeout_ms, 8_000);
        assert_eq!(ai.host.as_deref(), Some("http://gpu-box:11434"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("CMDGATE_TEST_KEY", "sk-test-123");
        let content = format!(
            "{MINIMAL}\n[ai]\nprovider = \"anthropic\"\nmodel = \"claude-haiku\"\napi_key = \"${{CMDGATE_TEST_KEY}}\"\n"
        );
        let config = Config::parse(&content).unwrap();
        assert_eq!(config.ai.unwrap().api_key, "sk-test-123");
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let content = format!("{MINIMAL}\n[ai]\nprovider = \"gemini\"\nmodel = \"x\"\n");
        let err = Config::parse(&content).unwrap_err().to_string();
        assert!(err.contains("Unknown ai.provider"));
    }

    #[test]
    fn test_rejects_bad_ai_host() {
        let content = format!(
            "{MINIMAL}\n[ai]\nprovider = \"ollama\"\nmodel = \"x\"\nhost = \"ftp://nowhere\"\n"
        );
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let content = MINIMAL.replace(
            "sandbox_root = \"/tmp/sandbox\"",
            "sandbox_root = \"/tmp/sandbox\"\nai_confidence_threshold = 1.5",
        );
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let content = MINIMAL.replace(
            "sandbox_root = \"/tmp/sandbox\"",
            "sandbox_root = \"/tmp/sandbox\"\nmax_output_bytes = 0",
        );
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_example_config_parses() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-example");
        let config = Config::parse(include_str!("../config/cmdgate.example.toml")).unwrap();
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.policy.denied_commands, vec!["git".to_string()]);
        assert_eq!(config.ai.unwrap().api_key, "sk-example");
    }
}
