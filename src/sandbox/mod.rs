//! Sandboxed executor.
//!
//! Runs one approved command as a child process, never through a shell:
//!
//! 1. The text is split into a fixed argument vector (`argv`)
//! 2. The working directory is pinned to the sandbox root
//! 3. The environment is cleared down to a minimal safe set
//! 4. The child gets its own process group, killed as a whole on timeout
//! 5. Stdout and stderr share one byte budget; the excess is read and dropped

pub mod argv;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::policy::PolicyStore;
use crate::security::ApprovedCommand;

/// Exit code reported when the wall-clock timeout fired.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the program could not be found or started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

const READ_CHUNK: usize = 8 * 1024;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// What one child process run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Output beyond the byte budget was discarded
    pub truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Failures that mean the safety contract itself is in doubt.
/// Ordinary execution failures are reported inside `ExecutionOutcome`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("approved command does not tokenize into a program: {0}")]
    Unparseable(#[from] argv::ArgvError),
    #[error("sandbox root {0} is not a usable directory")]
    RootUnavailable(PathBuf),
}

/// Seam between the router and process execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &ApprovedCommand) -> Result<ExecutionOutcome, SandboxError>;
}

pub struct SandboxExecutor {
    root: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl SandboxExecutor {
    pub fn new(policy: &PolicyStore) -> Self {
        Self {
            root: policy.sandbox_root().to_path_buf(),
            timeout: policy.command_timeout,
            max_output_bytes: policy.max_output_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `command` with explicit limits.
    pub async fn execute(
        &self,
        command: &ApprovedCommand,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let argv = argv::tokenize(command.text())?;
        if !self.root.is_dir() {
            return Err(SandboxError::RootUnavailable(self.root.clone()));
        }

        let started = Instant::now();
        let mut child = match self.spawn(&argv) {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start '{}': {e}", argv[0]);
                return Ok(ExecutionOutcome {
                    stdout: Vec::new(),
                    stderr: format!("{}: {e}", argv[0]).into_bytes(),
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    truncated: false,
                    timed_out: false,
                    duration_ms: elapsed_ms(started),
                });
            }
        };
        let pid = child.id();
        debug!("Spawned '{}' (pid {:?}) in {}", argv[0], pid, self.root.display());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut capture = Capture::new(max_output_bytes);

        let waited = tokio::time::timeout(timeout, async {
            capture.drain(stdout, stderr).await;
            child.wait().await
        })
        .await;

        let (exit_code, timed_out) = match waited {
            Ok(Ok(status)) => (exit_code_of(status), false),
            Ok(Err(e)) => {
                warn!("Waiting for '{}' failed: {e}", argv[0]);
                capture.note(&format!("\nwait failed: {e}"));
                (-1, false)
            }
            Err(_) => {
                warn!(
                    "'{}' exceeded {}ms, killing process group",
                    argv[0],
                    timeout.as_millis()
                );
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let duration_ms = elapsed_ms(started);
        info!(
            "'{}' finished: exit {exit_code}, {} bytes captured{}, {duration_ms}ms",
            argv[0],
            capture.stdout.len() + capture.stderr.len(),
            if capture.truncated { " (truncated)" } else { "" }
        );

        Ok(ExecutionOutcome {
            stdout: capture.stdout,
            stderr: capture.stderr,
            exit_code,
            truncated: capture.truncated,
            timed_out,
            duration_ms,
        })
    }

    fn spawn(&self, argv: &[String]) -> std::io::Result<Child> {
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.root)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &self.root)
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take down grandchildren too
            cmd.process_group(0);
        }

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
    }
}

#[async_trait]
impl CommandRunner for SandboxExecutor {
    async fn run(&self, command: &ApprovedCommand) -> Result<ExecutionOutcome, SandboxError> {
        self.execute(command, self.timeout, self.max_output_bytes).await
    }
}

/// Bounded capture of both output streams.
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, stream: Stream, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.stdout.len() + self.stderr.len());
        let take = remaining.min(chunk.len());
        if take < chunk.len() {
            self.truncated = true;
        }
        let target = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        target.extend_from_slice(&chunk[..take]);
    }

    /// Appends a diagnostic to stderr, within the budget.
    fn note(&mut self, message: &str) {
        self.push(Stream::Stderr, message.as_bytes());
    }

    /// Reads both pipes until EOF. Bytes past the budget are discarded
    /// as they arrive so the child never blocks on a full pipe.
    async fn drain<O, E>(&mut self, mut stdout: Option<O>, mut stderr: Option<E>)
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => self.push(Stream::Stdout, &out_buf[..n]),
                },
                read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => self.push(Stream::Stderr, &err_buf[..n]),
                },
                else => break,
            }
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // The child leads its own group, so its pid is the group id
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!("killpg({pgid}) failed: {e}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::policy::policy_for;

    fn executor(root: &Path) -> SandboxExecutor {
        SandboxExecutor::new(&policy_for(root))
    }

    async fn run(exec: &SandboxExecutor, text: &str) -> ExecutionOutcome {
        exec.run(&ApprovedCommand::unchecked(text)).await.unwrap()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&executor(dir.path()), "echo hello").await;
        assert_eq!(outcome.stdout, b"hello\n");
        assert!(outcome.stderr.is_empty());
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.truncated);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&executor(dir.path()), "echo '$HOME' 'a;b' '*'").await;
        assert_eq!(outcome.stdout, b"$HOME a;b *\n");
    }

    #[tokio::test]
    async fn test_working_directory_is_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let outcome = run(&exec, "pwd").await;
        let printed = String::from_utf8(outcome.stdout).unwrap();
        assert_eq!(printed.trim_end(), exec.root().to_str().unwrap());
    }

    #[tokio::test]
    async fn test_environment_is_minimal() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CMDGATE_LEAK_CHECK", "leaked");
        let outcome = run(&executor(dir.path()), "env").await;
        let env = String::from_utf8(outcome.stdout).unwrap();
        assert!(env.contains(&format!("PATH={SAFE_PATH}")));
        assert!(!env.contains("CMDGATE_LEAK_CHECK"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let outcome = run(&exec, "head -c 15360 /dev/zero").await;
        assert_eq!(outcome.stdout.len(), 10 * 1024);
        assert!(outcome.truncated);
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_output_at_cap_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let outcome = exec
            .execute(&ApprovedCommand::unchecked("head -c 512 /dev/zero"), Duration::from_secs(2), 512)
            .await
            .unwrap();
        assert_eq!(outcome.stdout.len(), 512);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_budget_is_shared_between_streams() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        // ls of a missing file writes to stderr only
        let outcome = exec
            .execute(&ApprovedCommand::unchecked("ls no-such-file"), Duration::from_secs(2), 8)
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.len() + outcome.stderr.len(), 8);
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let outcome = exec
            .execute(&ApprovedCommand::unchecked("sleep 5"), Duration::from_millis(300), 1024)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(outcome.timed_out);
        assert!(outcome.duration_ms >= 300, "{}", outcome.duration_ms);
        assert!(outcome.duration_ms < 2_000, "{}", outcome.duration_ms);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&executor(dir.path()), "definitely-not-a-program-xyz").await;
        assert_eq!(outcome.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(!outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&executor(dir.path()), "false").await;
        assert_eq!(outcome.exit_code, 1);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_unparseable_text_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec.run(&ApprovedCommand::unchecked("   ")).await;
        assert!(matches!(result, Err(SandboxError::Unparseable(_))));
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        drop(dir);
        let result = exec.run(&ApprovedCommand::unchecked("ls")).await;
        assert!(matches!(result, Err(SandboxError::RootUnavailable(_))));
    }
}
