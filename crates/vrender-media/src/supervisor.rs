//! Process supervisor for the encode step.
//!
//! Runs one external command with a hard wall-clock limit. On timeout the
//! child is killed (SIGKILL) and reaped before returning, so no encoder
//! outlives the attempt that started it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::ProcessCommand;

/// How long to wait for stderr to drain once the child has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of trailing stderr lines used when no known error line is found.
const STDERR_TAIL_LINES: usize = 3;

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)Error.*$",
        r"(?m)Invalid.*$",
        r"No such file or directory",
        r"Permission denied",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Why a run did not produce its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The program could not be started
    Spawn,
    /// Started, but its exit status could not be collected
    Wait,
    /// Wall-clock limit hit; the child was killed
    Timeout,
    /// Non-zero exit status
    Exit,
    /// Exit 0 but the output file is missing
    MissingOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

/// Result of one supervised run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output_path: PathBuf,
    pub duration_ms: Option<u64>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    fn succeeded(output_path: PathBuf, elapsed: Duration) -> Self {
        Self {
            output_path,
            duration_ms: Some(elapsed.as_millis() as u64),
            failure: None,
        }
    }

    fn failed(output_path: PathBuf, elapsed: Option<Duration>, failure: RunFailure) -> Self {
        Self {
            output_path,
            duration_ms: elapsed.map(|d| d.as_millis() as u64),
            failure: Some(failure),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(RunFailure { kind: FailureKind::Timeout, .. }))
    }
}

/// Capability to execute a compiled render command.
#[async_trait]
pub trait RenderRunner: Send + Sync {
    /// Run `command` to completion or until `timeout` elapses. Never panics
    /// and never leaves the child running.
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> RunReport;
}

/// Runs commands as child processes of the worker.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RenderRunner for ProcessSupervisor {
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> RunReport {
        let output_path = command.output_path.clone();
        debug!("Running: {}", command.display());

        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return RunReport::failed(
                    output_path,
                    None,
                    RunFailure {
                        kind: FailureKind::Spawn,
                        message: format!("Failed to spawn {}: {}", command.program, e),
                        exit_code: None,
                        stderr_tail: None,
                    },
                );
            }
        };

        let started = Instant::now();
        let mut stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                abort_stderr(stderr_task);
                return RunReport::failed(
                    output_path,
                    Some(started.elapsed()),
                    wait_failure(&command.program, &e),
                );
            }
            Err(_) => {
                // kill() sends SIGKILL and reaps the child
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out process {}: {}", command.program, e);
                }
                abort_stderr(stderr_task);
                warn!(
                    "{} killed after exceeding {}ms",
                    command.program,
                    timeout.as_millis()
                );
                return RunReport::failed(
                    output_path,
                    Some(started.elapsed()),
                    RunFailure {
                        kind: FailureKind::Timeout,
                        message: format!("FFmpeg timeout after {}ms", timeout.as_millis()),
                        exit_code: None,
                        stderr_tail: None,
                    },
                );
            }
        };

        let elapsed = started.elapsed();
        let stderr = match stderr_task.as_mut() {
            Some(handle) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut *handle).await {
                Ok(Ok(text)) => text,
                _ => {
                    handle.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        if !status.success() {
            let exit_code = status.code();
            let detail = extract_error_message(&stderr);
            let code = exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return RunReport::failed(
                output_path,
                Some(elapsed),
                RunFailure {
                    kind: FailureKind::Exit,
                    message: format!("FFmpeg exited with code {}: {}", code, detail),
                    exit_code,
                    stderr_tail: Some(detail),
                },
            );
        }

        if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            return RunReport::failed(
                output_path,
                Some(elapsed),
                RunFailure {
                    kind: FailureKind::MissingOutput,
                    message: "Output file not found after FFmpeg completed".to_string(),
                    exit_code: Some(0),
                    stderr_tail: None,
                },
            );
        }

        info!(
            "{} finished in {}ms: {}",
            command.program,
            elapsed.as_millis(),
            output_path.display()
        );
        RunReport::succeeded(output_path, elapsed)
    }
}

fn wait_failure(program: &str, e: &std::io::Error) -> RunFailure {
    RunFailure {
        kind: FailureKind::Wait,
        message: format!("Failed to wait for {}: {}", program, e),
        exit_code: None,
        stderr_tail: None,
    }
}

fn abort_stderr(task: Option<tokio::task::JoinHandle<String>>) {
    if let Some(handle) = task {
        handle.abort();
    }
}

/// Pick the most useful line out of encoder stderr.
///
/// The first known error pattern wins; otherwise the last few non-empty
/// lines joined by a space.
pub fn extract_error_message(stderr: &str) -> String {
    for pattern in ERROR_PATTERNS.iter() {
        if let Some(m) = pattern.find(stderr) {
            return m.as_str().trim().to_string();
        }
    }

    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, output: &std::path::Path) -> ProcessCommand {
        ProcessCommand::new("sh", ["-c", script], output)
    }

    #[test]
    fn test_extract_error_message_prefers_known_patterns() {
        let stderr = "frame=1\n[in] Invalid argument for option\nsomething else\n";
        assert_eq!(extract_error_message(stderr), "Invalid argument for option");

        let stderr = "Input #0\nError opening input file clip_0.jpg.\nExiting\n";
        assert_eq!(extract_error_message(stderr), "Error opening input file clip_0.jpg.");

        let stderr = "clip_9.jpg: No such file or directory";
        assert_eq!(extract_error_message(stderr), "No such file or directory");
    }

    #[test]
    fn test_extract_error_message_falls_back_to_tail() {
        let stderr = "one\ntwo\n\nthree\nfour\n";
        assert_eq!(extract_error_message(stderr), "two three four");
        assert_eq!(extract_error_message(""), "");
    }

    #[tokio::test]
    async fn test_run_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output.mp4");
        let cmd = sh(&format!("touch '{}'", out.display()), &out);

        let report = ProcessSupervisor::new().run(&cmd, Duration::from_secs(10)).await;

        assert!(report.success(), "{:?}", report.failure);
        assert_eq!(report.output_path, out);
        assert!(report.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_run_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output.mp4");
        let cmd = sh("exit 0", &out);

        let report = ProcessSupervisor::new().run(&cmd, Duration::from_secs(10)).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::MissingOutput);
        assert_eq!(failure.message, "Output file not found after FFmpeg completed");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_extracts_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output.mp4");
        let cmd = sh("echo 'noise' >&2; echo 'Error while opening encoder' >&2; exit 1", &out);

        let report = ProcessSupervisor::new().run(&cmd, Duration::from_secs(10)).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Exit);
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.message, "FFmpeg exited with code 1: Error while opening encoder");
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = ProcessCommand::new(
            "/nonexistent/definitely-not-ffmpeg",
            Vec::<String>::new(),
            dir.path().join("output.mp4"),
        );

        let report = ProcessSupervisor::new().run(&cmd, Duration::from_secs(10)).await;

        assert_eq!(report.failure.unwrap().kind, FailureKind::Spawn);
    }

    #[test]
    fn test_wait_error_is_not_a_spawn_failure() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "No child processes");
        let failure = wait_failure("ffmpeg", &err);

        assert_eq!(failure.kind, FailureKind::Wait);
        assert_eq!(failure.message, "Failed to wait for ffmpeg: No child processes");
        assert!(failure.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_run_timeout_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("exec sleep 30", &dir.path().join("output.mp4"));

        let started = Instant::now();
        let report = ProcessSupervisor::new().run(&cmd, Duration::from_millis(200)).await;

        assert!(report.timed_out());
        assert_eq!(report.error(), Some("FFmpeg timeout after 200ms"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let cmd = sh(
            &format!("echo $$ > '{}'; exec sleep 30", pidfile.display()),
            &dir.path().join("output.mp4"),
        );

        let report = ProcessSupervisor::new().run(&cmd, Duration::from_millis(300)).await;
        assert!(report.timed_out());

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_dir.exists(), "child {} still running", pid.trim());
    }
}
