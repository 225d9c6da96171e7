//! External step execution.
//!
//! Every external stage of the pipeline (environment setup commands, build
//! scripts, the installer, the test runner) goes through this module. Instead
//! of shell-level halt-on-error semantics, each step returns a structured
//! result the orchestrator inspects: captured output, exit status, duration.
//!
//! Each executed command is logged at info level with its full argv, which is
//! the rig's equivalent of a per-line execution trace.

use std::ffi::OsString;
use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};
use wait_timeout::ChildExt;

/// Default timeout for external steps (builds can be slow).
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1800);

// ============================================================================
// Step Specification
// ============================================================================

/// Specification for one external step.
#[derive(Debug, Clone)]
pub struct StepSpec {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, OsString)>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl StepSpec {
    /// Create a spec for `program` with no arguments and the default timeout.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        StepSpec {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child process only.
    ///
    /// The orchestrator's own environment is never mutated; configuration
    /// reaches collaborators exclusively through the spawned process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory for the child process.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable argv for logging and error messages.
    fn render(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Captured result of a completed step.
#[derive(Debug)]
pub struct StepOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration of the step.
    pub duration: Duration,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from running an external step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The program could not be started at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The program ran but exited unsuccessfully.
    #[error("`{command}` exited with {}{}", code_str(.status_code), stderr_excerpt(.stderr))]
    Failed {
        command: String,
        status_code: Option<i32>,
        stderr: String,
    },

    /// The program exceeded its timeout and was killed.
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    /// A step contracted to print an artifact path printed nothing.
    #[error("`{command}` printed no artifact path on stdout")]
    EmptyCapture { command: String },

    /// IO error while waiting on or reading from the child.
    #[error("IO error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl StepError {
    /// Exit code of the failed child, when one is known.
    pub fn child_exit_code(&self) -> Option<i32> {
        match self {
            StepError::Failed { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

fn code_str(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// Trailing stderr lines for error messages, so the failing command's own
/// diagnostics reach the user.
fn stderr_excerpt(stderr: &str) -> String {
    const MAX_LINES: usize = 20;

    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    let mut out = String::from(":\n");
    if start > 0 {
        out.push_str("  ...\n");
    }
    for line in &lines[start..] {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ============================================================================
// Execution
// ============================================================================

/// Run a step, capturing its output.
///
/// Respects the spec's timeout. If the command exceeds it, the child is
/// killed and a timeout error is returned.
pub fn run(spec: &StepSpec) -> Result<StepOutput, StepError> {
    let command = spec.render();
    info!(%command, "running step");

    let start = Instant::now();
    let mut cmd = spec.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| StepError::Spawn {
        command: command.clone(),
        source,
    })?;

    // Drain both pipes concurrently; a child that fills a pipe buffer would
    // otherwise block forever while we wait on it.
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_pipe(stdout_pipe));
    let stderr_reader = std::thread::spawn(move || read_pipe(stderr_pipe));

    let status = match child.wait_timeout(spec.timeout).map_err(|source| StepError::Io {
        command: command.clone(),
        source,
    })? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StepError::TimedOut {
                command,
                timeout: spec.timeout,
            });
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    let duration = start.elapsed();

    debug!(%command, ?duration, code = ?status.code(), "step finished");

    if status.success() {
        Ok(StepOutput {
            stdout,
            stderr,
            duration,
        })
    } else {
        Err(StepError::Failed {
            command,
            status_code: status.code(),
            stderr,
        })
    }
}

/// Run a step whose stdio is passed straight through to the user.
///
/// Used for the test runner, where the output stream is the point.
pub fn run_streamed(spec: &StepSpec) -> Result<Duration, StepError> {
    let command = spec.render();
    info!(%command, "running step");

    let start = Instant::now();
    let mut cmd = spec.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|source| StepError::Spawn {
        command: command.clone(),
        source,
    })?;

    let status = match child.wait_timeout(spec.timeout).map_err(|source| StepError::Io {
        command: command.clone(),
        source,
    })? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StepError::TimedOut {
                command,
                timeout: spec.timeout,
            });
        }
    };

    if status.success() {
        Ok(start.elapsed())
    } else {
        Err(StepError::Failed {
            command,
            status_code: status.code(),
            stderr: String::new(),
        })
    }
}

/// Run a step contracted to print exactly one filesystem path on stdout.
///
/// The captured value is trimmed; empty output is an error. The path is
/// trusted no further here; callers decide what validation to apply.
pub fn capture_path(spec: &StepSpec) -> Result<PathBuf, StepError> {
    let command = spec.render();
    let output = run(spec)?;

    let captured = output.stdout.trim();
    if captured.is_empty() {
        return Err(StepError::EmptyCapture { command });
    }

    Ok(PathBuf::from(captured))
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn sh(script: &str) -> StepSpec {
        StepSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn run_captures_stdout_and_stderr() {
        let out = run(&sh("printf out; printf err >&2")).unwrap();
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
    }

    #[test]
    fn run_reports_exit_code() {
        let err = run(&sh("printf boom >&2; exit 7")).unwrap_err();
        assert_eq!(err.child_exit_code(), Some(7));
        let msg = err.to_string();
        assert!(msg.contains("code 7"), "message: {msg}");
        assert!(msg.contains("boom"), "message should carry stderr: {msg}");
    }

    #[test]
    fn run_drains_output_larger_than_a_pipe_buffer() {
        // Both streams well past the kernel pipe buffer size.
        let script = "i=0\n\
                      while [ $i -lt 3000 ]; do\n\
                      printf '%0127dX\\n' $i\n\
                      printf '%0127dX\\n' $i >&2\n\
                      i=$((i+1))\n\
                      done";
        let out = run(&sh(script).timeout(Duration::from_secs(60))).unwrap();
        assert_eq!(out.stdout.len(), 3000 * 129);
        assert_eq!(out.stderr.len(), out.stdout.len());
    }

    #[test]
    fn run_times_out() {
        let spec = sh("sleep 5").timeout(Duration::from_millis(100));
        let err = run(&spec).unwrap_err();
        assert!(matches!(err, StepError::TimedOut { .. }));
    }

    #[test]
    fn run_reports_spawn_failure() {
        let err = run(&StepSpec::new("/nonexistent/program")).unwrap_err();
        assert!(matches!(err, StepError::Spawn { .. }));
    }

    #[test]
    fn capture_path_trims_trailing_newline() {
        let path = capture_path(&sh("echo /tmp/artifact.whl")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/artifact.whl"));
    }

    #[test]
    fn capture_path_rejects_empty_output() {
        let err = capture_path(&sh("true")).unwrap_err();
        assert!(matches!(err, StepError::EmptyCapture { .. }));
    }

    #[test]
    fn env_reaches_child_without_touching_parent() {
        let out = run(&sh("printf %s \"$RIG_STEP_PROBE\"").env("RIG_STEP_PROBE", "42")).unwrap();
        assert_eq!(out.stdout, "42");
        assert!(std::env::var("RIG_STEP_PROBE").is_err());
    }

    #[test]
    fn cwd_applies_to_child() {
        let temp = tempfile::TempDir::new().unwrap();
        let out = run(&sh("pwd").cwd(temp.path())).unwrap();
        let reported = PathBuf::from(out.stdout.trim()).canonicalize().unwrap();
        assert_eq!(reported, temp.path().canonicalize().unwrap());
    }
}
