//! Raw input clean-up, applied before classification.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI escape regex is valid")
    })
}

/// Strips NUL bytes, ANSI escape sequences and non-printable control
/// characters, then trims surrounding whitespace.
///
/// Tabs, newlines and carriage returns are kept so the validator can
/// refuse multi-line input explicitly rather than see it silently joined.
pub fn sanitize(raw: &str) -> String {
    let without_escapes = ansi_escape().replace_all(raw, "");
    without_escapes
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}
