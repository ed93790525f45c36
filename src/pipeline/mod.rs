//! Command admission pipeline.
//!
//! Pure data flows through here: a `CommandRequest` comes in from the
//! transport, becomes a `Candidate` (literal or AI-translated), gets a
//! `Verdict` from the validator, and leaves as exactly one
//! `OutcomeMessage`. Only the rate limiter and the policy store hold
//! state across requests.

pub mod classifier;
pub mod input;
pub mod router;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use classifier::{Classification, Classifier};
pub use router::Router;

/// One client-issued command event.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub raw_text: String,
    pub session_id: String,
    /// Source address of the client, used as the rate-limit key
    pub client_identity: String,
    pub received_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(
        raw_text: impl Into<String>,
        session_id: impl Into<String>,
        client_identity: impl Into<String>,
    ) -> Self {
        Self {
            raw_text: raw_text.into(),
            session_id: session_id.into(),
            client_identity: client_identity.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Literal,
    AiTranslated,
}

/// A single literal command proposed for validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub origin: Origin,
    /// Always 1.0 for literal input
    pub confidence: f64,
}

impl Candidate {
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Origin::Literal,
            confidence: 1.0,
        }
    }

    /// NaN and out-of-range scores are pinned to [0, 1]; NaN counts as 0.
    pub fn translated(text: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            text: text.into(),
            origin: Origin::AiTranslated,
            confidence,
        }
    }
}

/// Allow/deny decision produced by the security validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// The single response produced for each request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeMessage {
    Success {
        output: String,
        truncated: bool,
        duration_ms: u64,
    },
    Blocked {
        reason: String,
    },
    RateLimited,
    AiUnavailable,
    InterpretationNeedsConfirmation {
        candidate_text: String,
        confidence: f64,
    },
    RuntimeFailure {
        stderr: String,
        exit_code: i32,
        /// Stdout captured before the failure, if any
        output: String,
        truncated: bool,
        timed_out: bool,
    },
    EmptyCommand,
    /// The request was aborted because an internal invariant did not hold.
    InternalError,
}

impl OutcomeMessage {
    /// Stable outcome tag, as used on the wire and in history records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Blocked { .. } => "blocked",
            Self::RateLimited => "rate_limited",
            Self::AiUnavailable => "ai_unavailable",
            Self::InterpretationNeedsConfirmation { .. } => "interpretation_needs_confirmation",
            Self::RuntimeFailure { .. } => "runtime_failure",
            Self::EmptyCommand => "empty_command",
            Self::InternalError => "internal_error",
        }
    }
}
