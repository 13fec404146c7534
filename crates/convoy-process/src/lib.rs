//! Process execution for convoy.
//!
//! Every external program convoy drives (the version-control executable, an
//! external changelog generator) runs through [`run_command`]. Output is
//! captured, and the child is killed when its timeout elapses or when the
//! shared [`CancelToken`] fires.
//!
//! # Example
//!
//! ```ignore
//! use convoy_process::{CancelToken, CommandOptions, run_command};
//!
//! let cancel = CancelToken::new();
//! let opts = CommandOptions::in_dir("/tmp").cancel(cancel.clone());
//! let result = run_command("git", &["status", "--porcelain"], &opts).expect("run");
//! assert!(result.success);
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation shared by every blocking call of one run.
///
/// Cancelling is sticky: once [`CancelToken::cancel`] is called, or the
/// deadline passes, every clone reports cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that cancels itself once `budget` has elapsed.
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for `dur`, waking early on cancellation.
    ///
    /// Returns `false` when the sleep was cut short.
    pub fn sleep(&self, dur: Duration) -> bool {
        let until = Instant::now() + dur;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(POLL_INTERVAL));
        }
    }
}

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Killed because the timeout elapsed
    #[serde(default)]
    pub timed_out: bool,
    /// Killed because the run was cancelled
    #[serde(default)]
    pub cancelled: bool,
}

impl CommandResult {
    /// Check if the command succeeded
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            bail!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.combined_output().trim()
            )
        }
    }

    /// stdout followed by stderr, the form error classification looks at.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !out.is_empty() && !self.stderr.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// How to run a command.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub working_dir: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
    pub cancel: Option<CancelToken>,
}

impl CommandOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Run a command to completion, capturing its output.
///
/// A non-zero exit is not an error here; inspect [`CommandResult::success`].
/// Errors are reserved for failing to spawn or poll the child.
pub fn run_command(program: &str, args: &[&str], opts: &CommandOptions) -> Result<CommandResult> {
    let start = Instant::now();

    if let Some(token) = &opts.cancel
        && token.is_cancelled()
    {
        return Ok(CommandResult {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: "command not started: run cancelled".to_string(),
            duration_ms: 0,
            timed_out: false,
            cancelled: true,
        });
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &opts.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {} {:?}", program, args))?;

    // A child that exits without reading stdin closes the pipe; the exit
    // status tells that story, so write errors are ignored.
    let stdin_writer = match (&opts.stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.clone();
            Some(thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            }))
        }
        _ => None,
    };

    // Drain both pipes on their own threads so a chatty child cannot block
    // on a full pipe while we wait for it.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = opts.timeout.map(|t| start + t);
    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        if let Some(status) = child.try_wait().context("failed to poll command")? {
            break Some(status);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
        } else if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            cancelled = true;
        }
        if timed_out || cancelled {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(writer) = stdin_writer {
        let _ = writer.join();
    }
    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let mut stderr = stderr_reader.map(join_reader).unwrap_or_default();

    if timed_out && let Some(timeout) = opts.timeout {
        stderr.push_str(&format!(
            "\ncommand timed out after {}",
            humantime::format_duration(timeout)
        ));
    }
    if cancelled {
        stderr.push_str("\ncommand cancelled");
    }

    Ok(CommandResult {
        success: status.is_some_and(|s| s.success()),
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
        cancelled,
    })
}

/// Run a command in a specific directory with no other options.
pub fn run_command_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    run_command(program, args, &CommandOptions::in_dir(dir))
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).to_string()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn captures_stdout_and_exit_code() {
        let td = tempdir().expect("tempdir");
        let result = run_command_in_dir("sh", &["-c", "echo hello; exit 0"], td.path()).expect("run");
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[test]
    fn non_zero_exit_is_not_an_error() {
        let td = tempdir().expect("tempdir");
        let result =
            run_command_in_dir("sh", &["-c", "echo boom >&2; exit 3"], td.path()).expect("run");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.ok().is_err());
        assert!(result.combined_output().contains("boom"));
    }

    #[test]
    fn runs_in_working_dir() {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join("marker.txt"), "x").expect("write");
        let result = run_command_in_dir("ls", &[], td.path()).expect("run");
        assert!(result.stdout.contains("marker.txt"));
    }

    #[test]
    fn feeds_stdin() {
        let opts = CommandOptions::default().stdin("from stdin\n");
        let result = run_command("cat", &[], &opts).expect("run");
        assert_eq!(result.stdout, "from stdin\n");
    }

    #[test]
    fn kills_on_timeout() {
        let opts = CommandOptions::default().timeout(Duration::from_millis(200));
        let result = run_command("sleep", &["5"], &opts).expect("run");
        assert!(result.timed_out);
        assert!(!result.success);
        assert!(result.stderr.contains("timed out"));
        assert!(result.duration_ms < 4000);
    }

    #[test]
    fn kills_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            remote.cancel();
        });

        let opts = CommandOptions::default().cancel(token);
        let result = run_command("sleep", &["5"], &opts).expect("run");
        canceller.join().expect("join");

        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[test]
    fn cancelled_token_skips_spawn() {
        let token = CancelToken::new();
        token.cancel();
        let opts = CommandOptions::default().cancel(token);
        let result = run_command("this-command-does-not-exist-xyz123", &[], &opts).expect("run");
        assert!(result.cancelled);
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let result = run_command(
            "sh",
            &["-c", "i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"],
            &CommandOptions::default().timeout(Duration::from_secs(30)),
        )
        .expect("run");
        assert!(result.success);
        assert_eq!(result.stdout.lines().count(), 20000);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command("this-command-does-not-exist-xyz123", &[], &CommandOptions::default())
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[test]
    fn deadline_token_expires() {
        let token = CancelToken::with_deadline(Duration::from_millis(50));
        assert!(!token.is_cancelled());
        assert!(token.remaining().is_some());
        thread::sleep(Duration::from_millis(80));
        assert!(token.is_cancelled());
        assert_eq!(token.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn command_exists_nonexistent() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
        assert!(which("this-command-does-not-exist-xyz123").is_none());
    }

    #[test]
    fn command_result_serialization() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: String::new(),
            duration_ms: 150,
            timed_out: false,
            cancelled: false,
        };

        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"stdout\":\"output\""));
    }
}
