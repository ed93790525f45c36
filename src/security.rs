//! Security validator.
//!
//! Every candidate, literal or AI-translated, goes through
//! [`Validator::approve`] before it can reach the executor. The executor
//! only accepts an [`ApprovedCommand`], which cannot be built anywhere
//! else, so skipping validation does not type-check.

use std::sync::Arc;

use tracing::warn;

use crate::pipeline::Verdict;
use crate::policy::PolicyStore;
use crate::sandbox::argv::{self, ArgvError};

/// Characters that would chain, pipe, redirect, background or substitute
/// if a shell ever saw the text.
const METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '>', '<', '\n', '\r', '\0'];

/// Longest slice of attacker-controlled text echoed back in a reason.
const MAX_ECHOED_TOKEN: usize = 64;

/// Candidate text that passed every policy check, verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedCommand {
    text: String,
}

impl ApprovedCommand {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lets executor tests run commands the policy would refuse.
    #[cfg(test)]
    pub(crate) fn unchecked(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

pub struct Validator {
    policy: Arc<PolicyStore>,
}

impl Validator {
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self { policy }
    }

    /// Evaluates `text` against the policy. Checks run in a fixed order
    /// and stop at the first violation: denylist, path confinement,
    /// shell metacharacters, length.
    pub fn validate(&self, text: &str) -> Verdict {
        match self.first_violation(text) {
            Some(reason) => {
                warn!("Command denied: {reason}");
                Verdict::deny(reason)
            }
            None => Verdict::allow(),
        }
    }

    /// Validates `text` and, if allowed, wraps exactly that text for execution.
    pub fn approve(&self, text: &str) -> Result<ApprovedCommand, Verdict> {
        let verdict = self.validate(text);
        if verdict.allowed {
            Ok(ApprovedCommand {
                text: text.to_string(),
            })
        } else {
            Err(verdict)
        }
    }

    fn first_violation(&self, text: &str) -> Option<String> {
        if let Some(hit) = self.policy.denylist_match(text) {
            return Some(match hit.token {
                Some(token) => format!(
                    "denylist rule '{}' matched command '{}'",
                    hit.rule,
                    echo_token(&token)
                ),
                None => format!("denylist rule '{}' matched", hit.rule),
            });
        }

        let argv = match argv::tokenize(text) {
            Ok(argv) => argv,
            Err(ArgvError::Empty) => return Some("empty command".to_string()),
            Err(e) => return Some(e.to_string()),
        };
        if let Some(reason) = self.path_violation(&argv) {
            return Some(reason);
        }

        if let Some(c) = text.chars().find(|c| METACHARACTERS.contains(c)) {
            return Some(format!(
                "shell metacharacter '{}' is not permitted",
                c.escape_default()
            ));
        }

        let length = text.chars().count();
        if length > self.policy.max_command_length {
            return Some(format!(
                "command exceeds maximum length of {} characters",
                self.policy.max_command_length
            ));
        }

        None
    }

    fn path_violation(&self, argv: &[String]) -> Option<String> {
        let program = &argv[0];
        if program.contains('/') || program.contains('\\') {
            return Some(format!(
                "program must be a bare command name, got '{}'",
                echo_token(program)
            ));
        }

        for arg in &argv[1..] {
            for value in path_candidates(arg) {
                if value.starts_with('~') {
                    return Some(format!(
                        "home-relative path '{}' is not permitted",
                        echo_token(value)
                    ));
                }
                // bare names go through too: an existing entry may be a symlink out
                if !value.is_empty() && !self.policy.confines(value) {
                    return Some(format!(
                        "path '{}' escapes the sandbox root",
                        echo_token(value)
                    ));
                }
            }
        }
        None
    }
}

/// Every substring of `arg` a program could treat as a path.
///
/// Plain arguments are taken whole. Options can carry a value after `=`
/// (`--file=../x`) or glued to the flag letters (`-o../x`, `-t..`), so for
/// an option each suffix following a leading flag letter is a candidate.
fn path_candidates(arg: &str) -> Vec<&str> {
    if !arg.starts_with('-') {
        return vec![arg];
    }

    let mut candidates = Vec::new();
    if let Some((_, value)) = arg.split_once('=') {
        candidates.push(value);
    }
    let flags = arg.trim_start_matches('-');
    for (i, c) in flags.char_indices() {
        if !c.is_ascii_alphanumeric() {
            break;
        }
        candidates.push(&flags[i + c.len_utf8()..]);
    }
    candidates
}

/// Printable, bounded rendition of a rejected token.
fn echo_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_ECHOED_TOKEN)
        .collect()
}
