//! Structural tokenization of a command line into a fixed argument vector.
//!
//! Supports the quoting a user would type for a single command:
//! single quotes (literal), double quotes (backslash escapes `"` and `\`),
//! and backslash escapes outside quotes. Nothing is expanded: no globs,
//! no variables, no `~`. The first element is the program name.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgvError {
    #[error("empty command")]
    Empty,
    #[error("unbalanced quotes in command")]
    UnbalancedQuotes,
    #[error("trailing backslash in command")]
    TrailingBackslash,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Unquoted,
    Single,
    Double,
}

/// Splits `text` into a program name and its arguments.
pub fn tokenize(text: &str) -> Result<Vec<String>, ArgvError> {
    let mut argv = Vec::new();
    let mut current = String::new();
    // Distinguishes `''` (an empty argument) from no argument at all
    let mut in_token = false;
    let mut state = State::Unquoted;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Unquoted => match c {
                '\'' => {
                    state = State::Single;
                    in_token = true;
                }
                '"' => {
                    state = State::Double;
                    in_token = true;
                }
                '\\' => {
                    let escaped = chars.next().ok_or(ArgvError::TrailingBackslash)?;
                    current.push(escaped);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        argv.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
            State::Single => match c {
                '\'' => state = State::Unquoted,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Unquoted,
                '\\' => {
                    let next = chars.next().ok_or(ArgvError::UnbalancedQuotes)?;
                    if next != '"' && next != '\\' {
                        current.push('\\');
                    }
                    current.push(next);
                }
                c => current.push(c),
            },
        }
    }

    if state != State::Unquoted {
        return Err(ArgvError::UnbalancedQuotes);
    }
    if in_token {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(ArgvError::Empty);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(text: &str) -> Vec<String> {
        tokenize(text).unwrap()
    }

    #[test]
    fn test_plain_words() {
        assert_eq!(argv("ls -la  notes"), vec!["ls", "-la", "notes"]);
    }

    #[test]
    fn test_single_quotes_are_literal() {
        assert_eq!(argv(r"echo 'a \ b'"), vec!["echo", r"a \ b"]);
    }

    #[test]
    fn test_double_quotes_with_escapes() {
        assert_eq!(
            argv(r#"echo "say \"hi\" \n""#),
            vec!["echo", r#"say "hi" \n"#]
        );
    }

    #[test]
    fn test_adjacent_quoted_parts_join() {
        assert_eq!(argv(r#"echo foo'bar'"baz""#), vec!["echo", "foobarbaz"]);
    }

    #[test]
    fn test_empty_quoted_argument_is_kept() {
        assert_eq!(argv("grep '' file.txt"), vec!["grep", "", "file.txt"]);
    }

    #[test]
    fn test_backslash_escapes_space() {
        assert_eq!(argv(r"cat my\ file.txt"), vec!["cat", "my file.txt"]);
    }

    #[test]
    fn test_no_expansion() {
        assert_eq!(argv("echo $HOME ~ *.txt"), vec!["echo", "$HOME", "~", "*.txt"]);
    }

    #[test]
    fn test_errors() {
        assert_eq!(tokenize("   "), Err(ArgvError::Empty));
        assert_eq!(tokenize("echo 'oops"), Err(ArgvError::UnbalancedQuotes));
        assert_eq!(tokenize("echo \"oops"), Err(ArgvError::UnbalancedQuotes));
        assert_eq!(tokenize("echo oops\\"), Err(ArgvError::TrailingBackslash));
    }
}
