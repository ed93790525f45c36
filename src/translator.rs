//! Natural-language to command translation.
//!
//! The translator is an untrusted oracle. Whatever it answers is only ever a
//! candidate: the router still runs it through the validator and the
//! confidence gate. Every failure here is terminal for the request.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm::LlmClient;

const SYSTEM_PROMPT: &str = r#"You convert natural language instructions into a single Linux terminal command.

RULES:
1. Answer with exactly one command on one line, nothing else
2. Use only simple programs: ls, pwd, mkdir, rmdir, rm, cp, mv, touch, cat, head, tail, find, stat, echo, grep, wc, sort, diff, ps, uptime, date
3. Never use pipes, redirection, command substitution, variables, sudo or chained commands
4. Use relative paths inside the current directory
5. Never produce destructive or privileged operations
6. If the request is unclear or unsafe, answer: ERROR: <short reason>

EXAMPLES:
Input: show me all files in the current directory
Output: ls -la

Input: create a folder called test
Output: mkdir test

Input: copy file1.txt to backup.txt
Output: cp file1.txt backup.txt

Input: delete everything on the system
Output: ERROR: Destructive operation not allowed"#;

/// Requests refused before the translator is ever asked.
const DANGEROUS_REQUESTS: &[(&str, &str)] = &[
    ("delete-everything", r"delete\s+everything"),
    ("remove-all", r"remove\s+all"),
    ("wipe-system", r"wipe\s+(the\s+)?system"),
    ("format-disk", r"format\s+(the\s+)?(disk|drive)"),
    ("destroy", r"destroy\s+"),
    ("hack", r"hack\s+"),
    ("password", r"password\s+"),
    ("sudo", r"sudo\s+"),
    ("root-access", r"root\s+access"),
    ("shutdown", r"system\s+shutdown"),
    ("kill-all", r"kill\s+all"),
];

/// Request phrasings with an obvious program, as (pattern, program).
/// Only the first matching phrasing counts.
const CLEAR_PHRASES: &[(&str, &str)] = &[
    (r"list\s+(files|directory|contents)", "ls"),
    (r"show\s+(files|directory)", "ls"),
    (r"create\s+(a\s+)?(folder|directory)", "mkdir"),
    (r"make\s+(a\s+)?(folder|directory)", "mkdir"),
    (r"copy\s+\S+\s+to\s+\S+", "cp"),
    (r"move\s+\S+\s+to\s+\S+", "mv"),
    (r"show\s+(the\s+)?(contents?|text)\s+of", "cat"),
    (r"display\s+(the\s+)?(contents?|text)", "cat"),
    (r"current\s+directory", "pwd"),
    (r"where\s+am\s+i", "pwd"),
];

const BASE_CONFIDENCE: f64 = 0.5;
const CLEAR_PHRASE_BOOST: f64 = 0.3;
const COMPLEXITY_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub command: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum TranslateError {
    /// The request or the translator's answer was a refusal. The reason is
    /// a stable string and never contains the translator's own wording.
    #[error("{0}")]
    Refused(String),
    #[error("malformed translation: {0}")]
    Malformed(String),
    #[error("translation service error: {0}")]
    Service(#[from] anyhow::Error),
    #[error("translation timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<Translation, TranslateError>;

    fn description(&self) -> String;
}

/// Runs `translator` under its own deadline, independent of the executor's.
pub async fn translate_with_timeout(
    translator: &dyn Translator,
    text: &str,
    timeout: Duration,
) -> Result<Translation, TranslateError> {
    match tokio::time::timeout(timeout, translator.translate(text)).await {
        Ok(result) => result,
        Err(_) => Err(TranslateError::Timeout(timeout)),
    }
}

/// Translator backed by an LLM provider.
pub struct CommandTranslator {
    client: Box<dyn LlmClient>,
}

impl CommandTranslator {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Translator for CommandTranslator {
    async fn translate(&self, text: &str) -> Result<Translation, TranslateError> {
        if let Some(rule) = screen_request(text) {
            info!("Refusing translation, request matched '{rule}'");
            return Err(TranslateError::Refused(format!(
                "request matches dangerous-request rule '{rule}'"
            )));
        }

        let response = self.client.complete(SYSTEM_PROMPT, text).await?;
        let command = parse_answer(&response.text)?;
        let confidence = estimate_confidence(text, &command);
        debug!(
            "Translated to {command:?} (confidence {confidence:.2}, {} in / {} out tokens)",
            response.input_tokens, response.output_tokens
        );

        Ok(Translation {
            command,
            confidence,
        })
    }

    fn description(&self) -> String {
        self.client.description()
    }
}

fn compiled(table: &[(&'static str, &str)]) -> Vec<(&'static str, Regex)> {
    table
        .iter()
        .filter_map(|(tag, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*tag, re)),
            Err(e) => {
                warn!("Skipping invalid built-in pattern {pattern:?}: {e}");
                None
            }
        })
        .collect()
}

fn dangerous_requests() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| compiled(DANGEROUS_REQUESTS))
}

fn clear_phrases() -> &'static [(&'static str, Regex)] {
    static PHRASES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PHRASES.get_or_init(|| {
        let swapped: Vec<(&'static str, &'static str)> =
            CLEAR_PHRASES.iter().map(|(p, c)| (*c, *p)).collect();
        compiled(&swapped)
    })
}

/// Name of the first dangerous-request rule `text` matches.
pub fn screen_request(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    dangerous_requests()
        .iter()
        .find(|(_, re)| re.is_match(&lower))
        .map(|(name, _)| *name)
}

/// Extracts the single command line from a translator answer.
pub fn parse_answer(answer: &str) -> Result<String, TranslateError> {
    let lines: Vec<&str> = answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .collect();

    let first = match lines.first() {
        Some(first) => *first,
        None => return Err(TranslateError::Malformed("empty answer".to_string())),
    };

    if let Some(reason) = first.strip_prefix("ERROR:") {
        info!("Translator declined: {}", reason.trim());
        return Err(TranslateError::Refused(
            "the request could not be safely translated".to_string(),
        ));
    }

    if lines.len() > 1 {
        return Err(TranslateError::Malformed(format!(
            "expected one command, got {} lines",
            lines.len()
        )));
    }

    let command = first.trim_matches('`').trim();
    if command.is_empty() {
        return Err(TranslateError::Malformed("empty answer".to_string()));
    }
    Ok(command.to_string())
}

/// Local confidence score in [0, 1] for a translation of `request`.
pub fn estimate_confidence(request: &str, command: &str) -> f64 {
    let mut confidence = BASE_CONFIDENCE;
    let lower = request.to_lowercase();
    let tokens: Vec<&str> = command.split_whitespace().collect();

    if let Some((program, _)) = clear_phrases().iter().find(|(_, re)| re.is_match(&lower)) {
        if tokens.first() == Some(program) {
            confidence += CLEAR_PHRASE_BOOST;
        }
    }

    if request.split_whitespace().count() > 10 {
        confidence -= COMPLEXITY_PENALTY;
    }
    if tokens.len() > 5 {
        confidence -= COMPLEXITY_PENALTY;
    }

    confidence.clamp(0.0, 1.0)
}
