//! Literal vs. natural-language classification.
//!
//! Deterministic and side-effect free. Text is literal only when its first
//! token is a known program and nothing in it reads like English; every
//! other case, ambiguous ones included, goes to translation, where the
//! confidence gate still applies.

use std::collections::HashSet;

/// Programs typed directly at a terminal. Denied programs are listed too,
/// so that `sudo ls` is classified literal and refused with a precise
/// reason instead of being sent to the translator.
const KNOWN_COMMANDS: &[&str] = &[
    // files
    "ls", "pwd", "mkdir", "rmdir", "rm", "cp", "mv", "touch", "cat", "head", "tail", "find",
    "tree", "stat", "file", "du", "df", "ln", "basename", "dirname", "realpath",
    // text
    "echo", "printf", "grep", "wc", "sort", "uniq", "diff", "cut", "tr", "nl", "tac", "rev",
    "sed", "awk", "md5sum", "sha1sum", "sha256sum", "base64", "seq",
    // system
    "ps", "top", "uptime", "date", "cal", "env", "whoami", "id", "uname", "hostname", "true",
    "false",
    // network
    "ping", "curl", "wget", "nslookup", "ifconfig", "ip", "traceroute",
    // process and privilege
    "kill", "killall", "sudo", "su",
];

/// Leading words of a question or a request.
const LEADING_MARKERS: &[&str] = &[
    "how", "what", "where", "when", "why", "which", "who", "whose", "can", "could", "would",
    "should", "please", "show", "tell", "give", "create", "make", "list", "display", "delete",
    "remove", "copy", "move", "search", "locate",
];

/// Phrases that do not occur in a plain command line.
const PHRASE_MARKERS: &[&str] = &[
    "please", "can you", "could you", "would you", "for me", "i want", "i need", "i'd like",
    "help me", "show me", "tell me", "give me", "let me", "the", "all", "every", "my",
    "called", "named", "containing",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Literal,
    NaturalLanguage,
}

pub struct Classifier {
    known: HashSet<String>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::with_extra(&[])
    }

    /// Built-in command set plus `extra` names (compared case-insensitively).
    pub fn with_extra(extra: &[String]) -> Self {
        let known = KNOWN_COMMANDS
            .iter()
            .map(|c| c.to_string())
            .chain(extra.iter().map(|c| c.to_lowercase()))
            .collect();
        Self { known }
    }

    pub fn classify(&self, text: &str) -> Classification {
        let lower = text.trim().to_lowercase();
        let first = match lower.split_whitespace().next() {
            Some(first) => first,
            None => return Classification::NaturalLanguage,
        };

        if self.known.contains(first) && !has_language_markers(&lower) {
            Classification::Literal
        } else {
            Classification::NaturalLanguage
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn has_language_markers(lower: &str) -> bool {
    if lower.ends_with('?') {
        return true;
    }

    let words: Vec<&str> = lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ',' | '.' | '!' | '?')))
        .collect();

    if words.first().is_some_and(|w| LEADING_MARKERS.contains(w)) {
        return true;
    }

    let padded = format!(" {} ", words.join(" "));
    PHRASE_MARKERS
        .iter()
        .any(|marker| padded.contains(&format!(" {marker} ")))
}
