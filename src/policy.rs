//! Process-wide security policy.
//!
//! Built once at startup from `[policy]` and never mutated afterwards;
//! shared read-only behind an `Arc`. The built-in denylist below is the
//! auditable baseline; config entries are appended to it, never replace it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::info;

use crate::config::PolicyConfig;
use crate::sandbox::argv;

/// Program names refused as the leading token, grouped by rule name.
///
/// Matched against the basename of the leading token, case-insensitively,
/// and also against the part before its first `.` (`python3.11`, `mkfs.ext4`).
const DENIED_COMMANDS: &[(&str, &[&str])] = &[
    ("privilege-escalation", &["sudo", "su", "doas", "pkexec", "runuser"]),
    (
        "account-management",
        &["passwd", "chpasswd", "useradd", "userdel", "usermod", "groupadd", "groupdel", "visudo"],
    ),
    (
        "shell-interpreter",
        &[
            "sh", "bash", "zsh", "dash", "ksh", "csh", "tcsh", "fish", "python", "python2",
            "python3", "perl", "ruby", "node", "php", "lua", "tclsh", "awk", "gawk", "mawk",
            "nawk", "sed",
        ],
    ),
    (
        "program-launcher",
        &[
            "exec", "eval", "source", "xargs", "nohup", "setsid", "timeout", "nice", "ionice",
            "stdbuf", "watch", "strace", "ltrace", "chroot", "unshare", "nsenter", "busybox",
            "script", "expect",
        ],
    ),
    (
        "network-transfer",
        &[
            "ssh", "scp", "sftp", "rsync", "nc", "ncat", "netcat", "socat", "telnet", "ftp",
            "tftp", "curl", "wget",
        ],
    ),
    (
        "process-control",
        &[
            "kill", "killall", "pkill", "systemctl", "service", "init", "telinit", "shutdown",
            "reboot", "halt", "poweroff",
        ],
    ),
    (
        "disk-format",
        &["mkfs", "fdisk", "parted", "dd", "format", "mount", "umount", "losetup", "wipefs", "shred"],
    ),
    (
        "package-management",
        &[
            "apt", "apt-get", "dpkg", "yum", "dnf", "rpm", "pacman", "apk", "snap", "pip", "pip3",
            "npm", "cargo", "gem", "brew",
        ],
    ),
    ("scheduling", &["crontab", "at", "batch", "atq"]),
    ("permission-change", &["chmod", "chown", "chgrp", "chattr", "setfacl"]),
    ("kernel-control", &["insmod", "rmmod", "modprobe", "sysctl"]),
];

/// Regex rules matched anywhere in the candidate text (case-insensitive).
const DENIED_PATTERNS: &[(&str, &str)] = &[
    // rm aimed at the filesystem root, home, or a bare wildcard, whatever the flags
    ("destructive-delete", r"\brm\s+(-\S+\s+)*(/|/\*|~/?\*?|\*)(\s|$)"),
    // `env` with arguments runs another program
    ("program-launcher", r"^\s*env\s+\S"),
    ("find-exec", r"\s-(exec|execdir|ok|okdir|delete)(\s|$)"),
    ("credential-access", r"(^|[\s/])\.ssh(/|\s|$)|\bid_(rsa|dsa|ecdsa|ed25519)\b|/etc/(shadow|sudoers)"),
];

/// A named denylist entry.
#[derive(Debug)]
pub struct DenyRule {
    pub name: String,
    matcher: RuleMatcher,
}

#[derive(Debug)]
enum RuleMatcher {
    Commands(HashSet<String>),
    Pattern(Regex),
}

/// What a denylist hit looks like to the validator.
#[derive(Debug, Clone, PartialEq)]
pub struct DenyMatch<'a> {
    pub rule: &'a str,
    /// The offending program name, for command rules
    pub token: Option<String>,
}

impl DenyRule {
    fn commands(name: &str, programs: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.to_string(),
            matcher: RuleMatcher::Commands(
                programs.into_iter().map(|p| p.to_lowercase()).collect(),
            ),
        }
    }

    fn pattern(name: &str, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid denylist pattern for rule '{name}': {pattern}"))?;
        Ok(Self {
            name: name.to_string(),
            matcher: RuleMatcher::Pattern(regex),
        })
    }
}

/// Immutable policy table consulted by every pipeline stage.
#[derive(Debug)]
pub struct PolicyStore {
    rules: Vec<DenyRule>,
    sandbox_root: PathBuf,
    blocked_clients: HashSet<String>,
    known_commands: Vec<String>,
    pub max_command_length: usize,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
    pub confidence_threshold: f64,
}

impl PolicyStore {
    /// Compiles the denylist and pins the sandbox root.
    ///
    /// The sandbox root is created if missing and canonicalized, so that
    /// confinement checks compare against the real location.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.sandbox_root).with_context(|| {
            format!("Cannot create sandbox root {}", config.sandbox_root.display())
        })?;
        let sandbox_root = config.sandbox_root.canonicalize().with_context(|| {
            format!("Cannot resolve sandbox root {}", config.sandbox_root.display())
        })?;

        let mut rules: Vec<DenyRule> = DENIED_COMMANDS
            .iter()
            .map(|(name, programs)| DenyRule::commands(name, programs.iter().map(|p| p.to_string())))
            .collect();
        for (name, pattern) in DENIED_PATTERNS {
            rules.push(DenyRule::pattern(name, pattern)?);
        }
        if !config.denied_commands.is_empty() {
            rules.push(DenyRule::commands(
                "configured-command",
                config.denied_commands.iter().cloned(),
            ));
        }
        for pattern in &config.denied_patterns {
            rules.push(DenyRule::pattern("configured-pattern", pattern)?);
        }

        info!(
            "Policy loaded: {} denylist rules, sandbox root {}",
            rules.len(),
            sandbox_root.display()
        );

        Ok(Self {
            rules,
            sandbox_root,
            blocked_clients: config.blocked_clients.iter().cloned().collect(),
            known_commands: config.known_commands.iter().map(|c| c.to_lowercase()).collect(),
            max_command_length: config.max_command_length,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            max_output_bytes: config.max_output_bytes,
            confidence_threshold: config.ai_confidence_threshold,
        })
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// Extra literal command names supplied by configuration
    pub fn known_commands(&self) -> &[String] {
        &self.known_commands
    }

    pub fn is_blocked(&self, client: &str) -> bool {
        self.blocked_clients.contains(client)
    }

    /// Returns the first denylist rule hit by `text`, if any.
    ///
    /// Command rules look only at the program name; pattern rules at the
    /// whole text. Both see the text as typed and as the executor will
    /// see it after unquoting, so `'sudo'` or `"env" sh` do not slip by.
    pub fn denylist_match(&self, text: &str) -> Option<DenyMatch<'_>> {
        let argv = argv::tokenize(text).ok();
        let unquoted = argv.as_ref().map(|a| a.join(" "));
        let program = argv
            .as_ref()
            .and_then(|a| a.first().cloned())
            .unwrap_or_else(|| text.split_whitespace().next().unwrap_or("").to_string())
            .to_lowercase();
        let base = program.rsplit('/').next().unwrap_or(&program).to_string();
        let stem = base.split('.').next().unwrap_or(&base).to_string();

        self.rules.iter().find_map(|rule| {
            let hit = match &rule.matcher {
                RuleMatcher::Commands(names) => {
                    !base.is_empty() && (names.contains(&base) || names.contains(&stem))
                }
                RuleMatcher::Pattern(regex) => {
                    regex.is_match(text) || unquoted.as_deref().is_some_and(|u| regex.is_match(u))
                }
            };
            hit.then(|| DenyMatch {
                rule: &rule.name,
                token: matches!(rule.matcher, RuleMatcher::Commands(_)).then(|| base.clone()),
            })
        })
    }

    /// Lexically resolves `raw` against the sandbox root and reports whether
    /// it stays inside.
    ///
    /// `.` and `..` are folded without touching the filesystem; `..` can
    /// never climb above `/`. The deepest existing part of the result is
    /// then canonicalized, so a symlink pointing outside the root is refused
    /// even when the final component does not exist yet.
    pub fn confines(&self, raw: &str) -> bool {
        let path = Path::new(raw);
        let mut resolved = if path.is_absolute() {
            PathBuf::from("/")
        } else {
            self.sandbox_root.clone()
        };

        for component in path.components() {
            match component {
                Component::Prefix(_) => return false,
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(part) => resolved.push(part),
            }
        }

        if !resolved.starts_with(&self.sandbox_root) {
            return false;
        }

        // The deepest entry that exists decides where the path really lands;
        // a dangling symlink fails to canonicalize and is refused.
        match resolved.ancestors().find(|p| p.symlink_metadata().is_ok()) {
            Some(existing) => existing
                .canonicalize()
                .map(|real| real.starts_with(&self.sandbox_root))
                .unwrap_or(false),
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) fn policy_for(root: &Path) -> PolicyStore {
    PolicyStore::from_config(&PolicyConfig {
        sandbox_root: root.to_path_buf(),
        max_command_length: 1000,
        command_timeout_ms: 2_000,
        max_output_bytes: 10 * 1024,
        ai_confidence_threshold: 0.7,
        denied_commands: vec![],
        denied_patterns: vec![],
        known_commands: vec![],
        blocked_clients: vec![],
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_for(policy: &PolicyStore, text: &str) -> Option<String> {
        policy.denylist_match(text).map(|m| m.rule.to_string())
    }

    #[test]
    fn test_command_rules_match_leading_token_only() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert_eq!(rule_for(&policy, "sudo ls").as_deref(), Some("privilege-escalation"));
        assert_eq!(rule_for(&policy, "echo sudo"), None);
    }

    #[test]
    fn test_command_rules_are_case_insensitive_and_strip_paths() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert_eq!(rule_for(&policy, "SUDO ls").as_deref(), Some("privilege-escalation"));
        assert_eq!(rule_for(&policy, "/usr/bin/wget x").as_deref(), Some("network-transfer"));
    }

    #[test]
    fn test_quoting_does_not_hide_denied_names() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert_eq!(rule_for(&policy, "'sudo' ls").as_deref(), Some("privilege-escalation"));
        assert_eq!(rule_for(&policy, r"s\udo ls").as_deref(), Some("privilege-escalation"));
        assert_eq!(rule_for(&policy, "\"env\" sh").as_deref(), Some("program-launcher"));
    }

    #[test]
    fn test_versioned_names_are_caught() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert_eq!(rule_for(&policy, "python3.11 -V").as_deref(), Some("shell-interpreter"));
        assert_eq!(rule_for(&policy, "mkfs.ext4 disk.img").as_deref(), Some("disk-format"));
    }

    #[test]
    fn test_token_is_reported_for_command_rules() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let hit = policy.denylist_match("Bash -i").unwrap();
        assert_eq!(hit.token.as_deref(), Some("bash"));
        let hit = policy.denylist_match("rm -rf /").unwrap();
        assert_eq!(hit.rule, "destructive-delete");
        assert!(hit.token.is_none());
    }

    #[test]
    fn test_destructive_delete_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        for text in ["rm -rf /", "rm -rf /*", "RM -Rf ~", "rm -r -f *", "rm -rf ~/*"] {
            assert_eq!(rule_for(&policy, text).as_deref(), Some("destructive-delete"), "{text}");
        }
        assert_eq!(rule_for(&policy, "rm notes.txt"), None);
        assert_eq!(rule_for(&policy, "rm -r build"), None);
    }

    #[test]
    fn test_pattern_rules() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert_eq!(rule_for(&policy, "env bash").as_deref(), Some("program-launcher"));
        assert_eq!(rule_for(&policy, "env"), None);
        assert_eq!(rule_for(&policy, "find . -exec ls {} ;").as_deref(), Some("find-exec"));
        assert_eq!(rule_for(&policy, "cat .ssh/config").as_deref(), Some("credential-access"));
    }

    #[test]
    fn test_configured_rules_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyStore::from_config(&PolicyConfig {
            sandbox_root: dir.path().to_path_buf(),
            max_command_length: 1000,
            command_timeout_ms: 1000,
            max_output_bytes: 1024,
            ai_confidence_threshold: 0.7,
            denied_commands: vec!["Tar".to_string()],
            denied_patterns: vec![r"secret\.txt".to_string()],
            known_commands: vec!["JQ".to_string()],
            blocked_clients: vec!["10.0.0.66".to_string()],
        })
        .unwrap();
        assert_eq!(rule_for(&policy, "tar xf a.tar").as_deref(), Some("configured-command"));
        assert_eq!(rule_for(&policy, "cat SECRET.TXT").as_deref(), Some("configured-pattern"));
        // built-ins still apply
        assert_eq!(rule_for(&policy, "sudo ls").as_deref(), Some("privilege-escalation"));
        assert_eq!(policy.known_commands(), ["jq".to_string()]);
        assert!(policy.is_blocked("10.0.0.66"));
        assert!(!policy.is_blocked("10.0.0.67"));
    }

    #[test]
    fn test_invalid_configured_pattern_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = PolicyStore::from_config(&PolicyConfig {
            sandbox_root: dir.path().to_path_buf(),
            max_command_length: 1000,
            command_timeout_ms: 1000,
            max_output_bytes: 1024,
            ai_confidence_threshold: 0.7,
            denied_commands: vec![],
            denied_patterns: vec!["(unclosed".to_string()],
            known_commands: vec![],
            blocked_clients: vec![],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_confines_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.confines("notes/today.txt"));
        assert!(policy.confines("./a/../b"));
        assert!(policy.confines("."));
        assert!(!policy.confines(".."));
        assert!(!policy.confines("a/../../etc"));
    }

    #[test]
    fn test_confines_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let inside = policy.sandbox_root().join("x.txt");
        assert!(policy.confines(inside.to_str().unwrap()));
        assert!(!policy.confines("/etc/passwd"));
        assert!(!policy.confines("/"));
        // climbing above / stays at /
        assert!(!policy.confines("/../../../etc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_confines_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let policy = policy_for(dir.path());
        assert!(!policy.confines("link"));
        assert!(!policy.confines("link/new-file.txt"));
        assert!(policy.confines("new-file.txt"));
    }
}
