//! Per-request orchestration.
//!
//! `handle` runs one request through every stage and always returns
//! exactly one outcome. Each stage can end the request early; nothing is
//! executed unless the validator approved the exact text being run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::input::sanitize;
use super::{Candidate, Classification, Classifier, CommandRequest, Origin, OutcomeMessage, Verdict};
use crate::history::{HistoryRecord, HistorySink};
use crate::policy::PolicyStore;
use crate::rate_limit::RateLimiter;
use crate::sandbox::{CommandRunner, ExecutionOutcome};
use crate::security::Validator;
use crate::translator::{translate_with_timeout, TranslateError, Translator};

/// Default deadline for one translation call.
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(8);

pub struct Router {
    policy: Arc<PolicyStore>,
    limiter: Arc<RateLimiter>,
    classifier: Classifier,
    validator: Validator,
    translator: Option<Arc<dyn Translator>>,
    ai_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    history: Arc<dyn HistorySink>,
}

/// What the request got as far as, for the history record.
#[derive(Default)]
struct Trace {
    candidate_text: Option<String>,
    verdict: Option<Verdict>,
}

impl Router {
    pub fn new(
        policy: Arc<PolicyStore>,
        limiter: Arc<RateLimiter>,
        runner: Arc<dyn CommandRunner>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            classifier: Classifier::with_extra(policy.known_commands()),
            validator: Validator::new(Arc::clone(&policy)),
            policy,
            limiter,
            translator: None,
            ai_timeout: DEFAULT_AI_TIMEOUT,
            runner,
            history,
        }
    }

    /// Enables natural-language requests. Without a translator they
    /// are answered with `AiUnavailable`.
    pub fn with_translator(mut self, translator: Arc<dyn Translator>, timeout: Duration) -> Self {
        self.translator = Some(translator);
        self.ai_timeout = timeout;
        self
    }

    pub async fn handle(&self, request: CommandRequest) -> OutcomeMessage {
        let mut trace = Trace::default();
        let outcome = self.evaluate(&request, &mut trace).await;
        let latency_ms = (Utc::now() - request.received_at)
            .num_milliseconds()
            .max(0) as u64;

        info!(
            client = %request.client_identity,
            session = %request.session_id,
            kind = outcome.kind(),
            latency_ms,
            "Request handled"
        );

        self.history.record(HistoryRecord {
            session_id: request.session_id,
            candidate_text: trace.candidate_text,
            verdict: trace.verdict,
            outcome: outcome.kind().to_string(),
            timestamp: request.received_at,
            latency_ms,
        });

        outcome
    }

    /// Newest history records of a session.
    ///
    /// Admitted like a command: blocked clients are refused and the
    /// lookup counts against the client's quota. The file read runs on
    /// the blocking pool.
    pub async fn history(
        &self,
        client_identity: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, OutcomeMessage> {
        if let Some(refused) = self.admit(client_identity) {
            return Err(refused);
        }

        let history = Arc::clone(&self.history);
        let session = session_id.to_string();
        match tokio::task::spawn_blocking(move || history.recent(&session, limit)).await {
            Ok(Ok(records)) => {
                debug!(client = %client_identity, session = %session_id, records = records.len(), "History read");
                Ok(records)
            }
            Ok(Err(e)) => {
                error!("History lookup for session {session_id} failed: {e}");
                Err(OutcomeMessage::InternalError)
            }
            Err(e) => {
                error!("History lookup task failed: {e}");
                Err(OutcomeMessage::InternalError)
            }
        }
    }

    /// Client-level gate shared by every kind of request.
    fn admit(&self, client_identity: &str) -> Option<OutcomeMessage> {
        if self.policy.is_blocked(client_identity) {
            warn!("Request from blocked client {client_identity}");
            return Some(OutcomeMessage::Blocked {
                reason: "client is blocked".to_string(),
            });
        }
        if !self.limiter.allow(client_identity) {
            return Some(OutcomeMessage::RateLimited);
        }
        None
    }

    async fn evaluate(&self, request: &CommandRequest, trace: &mut Trace) -> OutcomeMessage {
        if let Some(refused) = self.admit(&request.client_identity) {
            return refused;
        }

        let text = sanitize(&request.raw_text);
        if text.is_empty() {
            return OutcomeMessage::EmptyCommand;
        }

        let candidate = match self.classifier.classify(&text) {
            Classification::Literal => Candidate::literal(text),
            Classification::NaturalLanguage => match self.translate(&text).await {
                Ok(candidate) => candidate,
                Err(outcome) => return outcome,
            },
        };
        trace.candidate_text = Some(candidate.text.clone());

        let approved = match self.validator.approve(&candidate.text) {
            Ok(approved) => {
                trace.verdict = Some(Verdict::allow());
                approved
            }
            Err(verdict) => {
                let reason = verdict
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by policy".to_string());
                trace.verdict = Some(verdict);
                return OutcomeMessage::Blocked { reason };
            }
        };

        if candidate.origin == Origin::AiTranslated
            && candidate.confidence < self.policy.confidence_threshold
        {
            return OutcomeMessage::InterpretationNeedsConfirmation {
                candidate_text: candidate.text,
                confidence: candidate.confidence,
            };
        }

        // Only the text the verdict was computed on may run
        if approved.text() != candidate.text {
            error!(
                "Approved text {:?} differs from candidate {:?}, aborting request",
                approved.text(),
                candidate.text
            );
            return OutcomeMessage::InternalError;
        }

        match self.runner.run(&approved).await {
            Ok(outcome) => present(outcome),
            Err(e) => {
                error!("Execution aborted for {:?}: {e}", approved.text());
                OutcomeMessage::InternalError
            }
        }
    }

    /// Translation never falls back to running the untranslated text.
    async fn translate(&self, text: &str) -> Result<Candidate, OutcomeMessage> {
        let Some(translator) = &self.translator else {
            debug!("No translator configured for natural-language request");
            return Err(OutcomeMessage::AiUnavailable);
        };

        match translate_with_timeout(translator.as_ref(), text, self.ai_timeout).await {
            Ok(translation) => Ok(Candidate::translated(
                translation.command,
                translation.confidence,
            )),
            Err(TranslateError::Refused(reason)) => Err(OutcomeMessage::Blocked { reason }),
            Err(e) => {
                warn!("Translation failed ({}): {e}", translator.description());
                Err(OutcomeMessage::AiUnavailable)
            }
        }
    }
}

fn present(outcome: ExecutionOutcome) -> OutcomeMessage {
    let output = String::from_utf8_lossy(&outcome.stdout).into_owned();
    if outcome.exit_code == 0 && !outcome.timed_out {
        OutcomeMessage::Success {
            output,
            truncated: outcome.truncated,
            duration_ms: outcome.duration_ms,
        }
    } else {
        OutcomeMessage::RuntimeFailure {
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
            exit_code: outcome.exit_code,
            output,
            truncated: outcome.truncated,
            timed_out: outcome.timed_out,
        }
    }
}
