// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-runner
#![deny(unsafe_code)]

mod capture;
mod patch;

pub use capture::{truncate_utf8, StreamCapture};
pub use patch::lint_patch;

use osp_artifact::{ArtifactRef, ArtifactStore};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_paths::RunnerBudgets;
use osp_store::{JobPatch, JobStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Commands allowed without any environment extension.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["git", "kubectl", "helm", "kustomize", "argocd", "flux"];

/// Environment variable extending the allowlist (comma-separated).
pub const ENV_ALLOWED_COMMANDS: &str = "SF_REPO_ALLOWED_COMMANDS";

/// Shell interpreters refused outright, as command or argument.
const SHELL_DENYLIST: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "csh", "tcsh", "fish", "cmd", "cmd.exe", "powershell",
    "powershell.exe", "pwsh",
];

/// Grace period between the soft and hard kill signals.
const KILL_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Request / result shapes
// ---------------------------------------------------------------------------

/// One subprocess invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecRequest {
    /// Bare command name; must be on the allowlist.
    pub command: String,
    /// Literal arguments (no shell expansion ever happens).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the repo root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bytes fed to the child's stdin.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Requested wall-clock budget (clamped to the tool-call budget unless
    /// the call detaches).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Opt into detaching as a background job when the requested timeout
    /// exceeds the tool-call budget.
    #[serde(default)]
    pub detach: bool,
}

/// Captured result of one stream.
#[derive(Debug, Clone)]
pub struct StreamResult {
    /// Inline slice (UTF-8, truncated at a character boundary).
    pub inline: String,
    /// Spill artifact holding the captured prefix, when overflow occurred.
    pub artifact: Option<ArtifactRef>,
    /// Bytes retained in the capture buffer.
    pub captured_bytes: u64,
    /// Total bytes the stream produced.
    pub total_bytes: u64,
    /// Whether the capture dropped trailing output.
    pub truncated: bool,
    /// Whether the inline slice is shorter than the capture.
    pub inline_truncated: bool,
}

/// Completed subprocess result.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code (absent when killed by signal).
    pub exit_code: Option<i32>,
    /// Whether the wall-clock budget expired.
    pub timed_out: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Captured stdout.
    pub stdout: StreamResult,
    /// Captured stderr.
    pub stderr: StreamResult,
}

impl ExecResult {
    /// Whether the process completed with exit code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

// The wire shape flattens both streams into prefixed keys
// (`stdout_inline`, `stdout_ref`, `stdout_truncated`, …) so callers never
// dig through nested objects for the common fields.
impl Serialize for ExecResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("exit_code", &self.exit_code)?;
        map.serialize_entry("timed_out", &self.timed_out)?;
        map.serialize_entry("duration_ms", &self.duration_ms)?;
        for (prefix, stream) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            map.serialize_entry(&format!("{prefix}_inline"), &stream.inline)?;
            if let Some(artifact) = &stream.artifact {
                map.serialize_entry(&format!("{prefix}_ref"), artifact)?;
            }
            map.serialize_entry(&format!("{prefix}_captured_bytes"), &stream.captured_bytes)?;
            map.serialize_entry(&format!("{prefix}_total_bytes"), &stream.total_bytes)?;
            map.serialize_entry(&format!("{prefix}_truncated"), &stream.truncated)?;
            map.serialize_entry(
                &format!("{prefix}_inline_truncated"),
                &stream.inline_truncated,
            )?;
        }
        map.end()
    }
}

/// Either a completed execution or a detached background job.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExecOutcome {
    /// The call ran to completion (or timeout) inline.
    Completed(ExecResult),
    /// The call detached; poll the job store for progress.
    Detached {
        /// Marker for clients: the response shape changed deliberately.
        detached: bool,
        /// Background job id.
        job_id: String,
        /// How to wait for the job.
        wait: String,
        /// Where captured output will land.
        logs: String,
    },
}

// ---------------------------------------------------------------------------
// SafeRunner
// ---------------------------------------------------------------------------

/// Allowlisted subprocess runner confined to one repository root.
#[derive(Clone)]
pub struct SafeRunner {
    repo_root: PathBuf,
    artifacts: ArtifactStore,
    budgets: RunnerBudgets,
    allowlist: BTreeSet<String>,
    jobs: Option<Arc<JobStore>>,
    tool_call_timeout_ms: u64,
}

impl std::fmt::Debug for SafeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeRunner")
            .field("repo_root", &self.repo_root)
            .field("allowlist", &self.allowlist)
            .finish()
    }
}

impl SafeRunner {
    /// Build a runner confined to `repo_root`.
    ///
    /// # Errors
    ///
    /// Fails when `repo_root` cannot be canonicalized.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        artifacts: ArtifactStore,
        budgets: RunnerBudgets,
        tool_call_timeout_ms: u64,
    ) -> ToolResult<Self> {
        let repo_root = repo_root.into();
        let repo_root = repo_root
            .canonicalize()
            .map_err(|e| ToolError::internal(format!("canonicalize repo root: {e}")))?;
        let mut allowlist: BTreeSet<String> = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|c| (*c).to_string())
            .collect();
        if let Ok(extra) = std::env::var(ENV_ALLOWED_COMMANDS) {
            allowlist.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned),
            );
        }
        Ok(Self {
            repo_root,
            artifacts,
            budgets,
            allowlist,
            jobs: None,
            tool_call_timeout_ms,
        })
    }

    /// Replace the allowlist (tests and constrained deployments).
    #[must_use]
    pub fn with_allowlist(mut self, allowlist: impl IntoIterator<Item = String>) -> Self {
        self.allowlist = allowlist.into_iter().collect();
        self
    }

    /// Attach a job store, enabling detached execution.
    #[must_use]
    pub fn with_jobs(mut self, jobs: Arc<JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// The canonical repository root this runner is confined to.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Execute a request, detaching when asked and eligible.
    ///
    /// # Errors
    ///
    /// `COMMAND_NOT_ALLOWED`, `SHELL_REJECTED`, `ESCAPES_REPO_ROOT`, or
    /// internal spawn errors.
    pub async fn exec(
        &self,
        request: ExecRequest,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecOutcome> {
        self.vet(&request)?;

        let requested = request.timeout_ms.unwrap_or(self.tool_call_timeout_ms);
        if request.detach && requested > self.tool_call_timeout_ms {
            return self.detach(request, requested, trace_id, span_id);
        }

        let timeout = Duration::from_millis(requested.min(self.tool_call_timeout_ms));
        let result = self
            .run_child(&request, timeout, trace_id, span_id)
            .await?;
        Ok(ExecOutcome::Completed(result))
    }

    /// Apply a unified diff through `git apply`. Write-gated and linted.
    ///
    /// # Errors
    ///
    /// `APPLY_REQUIRED` without `apply`, `ESCAPES_REPO_ROOT` when a hunk
    /// targets a path outside the repo, plus the usual exec failures.
    pub async fn apply_patch(
        &self,
        patch: &str,
        apply: bool,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        require_apply(apply, "apply_patch")?;
        lint_patch(patch)?;
        let request = ExecRequest {
            command: "git".into(),
            args: vec!["apply", "--whitespace=nowarn", "-"]
                .into_iter()
                .map(String::from)
                .collect(),
            stdin: Some(patch.to_string()),
            ..ExecRequest::default()
        };
        self.exec_completed(request, trace_id, span_id).await
    }

    /// `git commit` with a message. Write-gated.
    ///
    /// # Errors
    ///
    /// `APPLY_REQUIRED` without `apply`, plus the usual exec failures.
    pub async fn git_commit(
        &self,
        message: &str,
        apply: bool,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        require_apply(apply, "git_commit")?;
        let request = ExecRequest {
            command: "git".into(),
            args: vec!["commit".into(), "-m".into(), message.to_string()],
            ..ExecRequest::default()
        };
        self.exec_completed(request, trace_id, span_id).await
    }

    /// `git push` to a remote/branch. Write-gated.
    ///
    /// # Errors
    ///
    /// `APPLY_REQUIRED` without `apply`, plus the usual exec failures.
    pub async fn git_push(
        &self,
        remote: &str,
        refspec: &str,
        apply: bool,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        require_apply(apply, "git_push")?;
        let request = ExecRequest {
            command: "git".into(),
            args: vec!["push".into(), remote.to_string(), refspec.to_string()],
            ..ExecRequest::default()
        };
        self.exec_completed(request, trace_id, span_id).await
    }

    /// `git revert --no-edit` of a commit. Write-gated.
    ///
    /// # Errors
    ///
    /// `APPLY_REQUIRED` without `apply`, plus the usual exec failures.
    pub async fn git_revert(
        &self,
        commit: &str,
        apply: bool,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        require_apply(apply, "git_revert")?;
        let request = ExecRequest {
            command: "git".into(),
            args: vec!["revert".into(), "--no-edit".into(), commit.to_string()],
            ..ExecRequest::default()
        };
        self.exec_completed(request, trace_id, span_id).await
    }

    async fn exec_completed(
        &self,
        request: ExecRequest,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        match self.exec(request, trace_id, span_id).await? {
            ExecOutcome::Completed(result) => Ok(result),
            ExecOutcome::Detached { .. } => {
                Err(ToolError::internal("write-gated actions never detach"))
            }
        }
    }

    // -- Vetting ---------------------------------------------------------

    fn vet(&self, request: &ExecRequest) -> ToolResult<()> {
        let command = request.command.trim();
        if command.is_empty() || command.contains('/') || command.contains('\\') {
            return Err(ToolError::new(
                ErrorCode::CommandNotAllowed,
                "command must be a bare allowlisted name",
            ));
        }
        if is_shell(command) {
            return Err(shell_rejected(command));
        }
        if !self.allowlist.contains(command) {
            return Err(ToolError::new(
                ErrorCode::CommandNotAllowed,
                format!("command '{command}' is not allowlisted"),
            )
            .with_hint(format!("allowed: {}", self.allowlist.iter().cloned().collect::<Vec<_>>().join(", "))));
        }
        for arg in &request.args {
            let base = arg.rsplit(['/', '\\']).next().unwrap_or(arg);
            if is_shell(base) {
                return Err(shell_rejected(arg));
            }
            if arg == "-c" && command != "git" {
                // `git -c key=val` is config, not a shell escape; anything
                // else gets no benefit of the doubt.
                return Err(shell_rejected(arg));
            }
            if arg.eq_ignore_ascii_case("/c") {
                return Err(shell_rejected(arg));
            }
        }
        if let Some(cwd) = &request.cwd {
            self.confine(cwd)?;
        }
        Ok(())
    }

    fn confine(&self, rel: &str) -> ToolResult<PathBuf> {
        let joined = self.repo_root.join(rel);
        let canonical = joined.canonicalize().map_err(|_| {
            ToolError::new(
                ErrorCode::EscapesRepoRoot,
                format!("path '{rel}' does not resolve inside the repo root"),
            )
        })?;
        if !canonical.starts_with(&self.repo_root) {
            return Err(ToolError::new(
                ErrorCode::EscapesRepoRoot,
                format!("path '{rel}' escapes the repo root"),
            ));
        }
        Ok(canonical)
    }

    // -- Child process ---------------------------------------------------

    async fn run_child(
        &self,
        request: &ExecRequest,
        timeout: Duration,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecResult> {
        let cwd = match &request.cwd {
            Some(rel) => self.confine(rel)?,
            None => self.repo_root.clone(),
        };

        debug!(
            target: "osp.runner",
            command = %request.command,
            args = ?request.args,
            cwd = %cwd.display(),
            timeout_ms = timeout.as_millis() as u64,
            "spawning"
        );

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&cwd)
            .envs(&request.env)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::internal(format!("spawn '{}': {e}", request.command)))?;

        if let Some(input) = &request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = input.clone().into_bytes();
                // Feed stdin concurrently; the child may exit early.
                tokio::spawn(async move {
                    let _ = stdin.write_all(&bytes).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let cap = self.budgets.max_capture_bytes;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain(stdout_pipe, cap));
        let stderr_task = tokio::spawn(drain(stderr_pipe, cap));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => return Err(ToolError::internal(format!("wait: {e}"))),
            Err(_) => {
                warn!(target: "osp.runner", command = %request.command, "timeout; terminating");
                terminate(&mut child).await;
                (None, true)
            }
        };

        let stdout_capture = stdout_task
            .await
            .map_err(|e| ToolError::internal(format!("join stdout reader: {e}")))?;
        let stderr_capture = stderr_task
            .await
            .map_err(|e| ToolError::internal(format!("join stderr reader: {e}")))?;

        let stdout = self.finish_stream(stdout_capture, "stdout.log", trace_id, span_id)?;
        let stderr = self.finish_stream(stderr_capture, "stderr.log", trace_id, span_id)?;

        Ok(ExecResult {
            exit_code,
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
            stdout,
            stderr,
        })
    }

    fn finish_stream(
        &self,
        capture: StreamCapture,
        filename: &str,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<StreamResult> {
        let inline = truncate_utf8(&capture.buffer, self.budgets.max_inline_bytes);
        let truncated = capture.total_bytes > capture.buffer.len() as u64;
        let inline_truncated = (inline.len() as u64) < capture.buffer.len() as u64;

        let artifact = if (truncated || inline_truncated) && !capture.buffer.is_empty() {
            let mut spilled = self
                .artifacts
                .write(trace_id, span_id, filename, &capture.buffer)?;
            if let Some(art) = &mut spilled {
                art.truncated = truncated;
            }
            spilled
        } else {
            None
        };

        Ok(StreamResult {
            inline,
            artifact,
            captured_bytes: capture.buffer.len() as u64,
            total_bytes: capture.total_bytes,
            truncated,
            inline_truncated,
        })
    }

    // -- Detach ----------------------------------------------------------

    fn detach(
        &self,
        request: ExecRequest,
        requested_timeout_ms: u64,
        trace_id: &str,
        span_id: &str,
    ) -> ToolResult<ExecOutcome> {
        let jobs = self.jobs.clone().ok_or_else(|| {
            ToolError::new(
                ErrorCode::CommandNotAllowed,
                "detached execution is not available without a job store",
            )
        })?;
        let record = jobs.create("repo.exec", trace_id, Some(span_id), None);
        let job_id = record.job_id.clone();

        let runner = self.clone();
        let spawn_trace_id = trace_id.to_string();
        let spawn_span_id = span_id.to_string();
        let detached_id = job_id.clone();
        tokio::spawn(async move {
            let _ = jobs.upsert(
                &detached_id,
                JobPatch {
                    status: Some("running".into()),
                    ..JobPatch::default()
                },
            );
            let timeout = Duration::from_millis(requested_timeout_ms);
            let outcome = runner
                .run_child(&request, timeout, &spawn_trace_id, &spawn_span_id)
                .await;
            let patch = match outcome {
                Ok(result) => JobPatch {
                    status: Some(if result.success() { "succeeded" } else { "failed" }.into()),
                    progress: serde_json::to_value(&result).ok(),
                    artifacts: serde_json::to_value(
                        [result.stdout.artifact.as_ref(), result.stderr.artifact.as_ref()]
                            .iter()
                            .flatten()
                            .collect::<Vec<_>>(),
                    )
                    .ok(),
                    ..JobPatch::default()
                },
                Err(err) => JobPatch {
                    status: Some("failed".into()),
                    error: serde_json::to_value(&err).ok(),
                    ..JobPatch::default()
                },
            };
            let _ = jobs.upsert(&detached_id, patch);
        });

        Ok(ExecOutcome::Detached {
            detached: true,
            job_id: job_id.clone(),
            wait: format!("mcp_job get {job_id}"),
            logs: format!("artifact://runs/{trace_id}/tool_calls/{span_id}/"),
        })
    }
}

fn require_apply(apply: bool, action: &str) -> ToolResult<()> {
    if apply {
        return Ok(());
    }
    Err(ToolError::new(
        ErrorCode::ApplyRequired,
        format!("'{action}' mutates the repository and requires apply: true"),
    )
    .with_hint("re-run with apply: true after reviewing the dry run"))
}

fn is_shell(name: &str) -> bool {
    SHELL_DENYLIST.contains(&name.to_ascii_lowercase().as_str())
}

fn shell_rejected(what: &str) -> ToolError {
    ToolError::new(
        ErrorCode::ShellRejected,
        format!("'{what}' smuggles a shell interpreter"),
    )
}

async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>, cap: usize) -> StreamCapture {
    let mut capture = StreamCapture::new(cap);
    let Some(mut pipe) = pipe else {
        return capture;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.push(&chunk[..n]),
        }
    }
    capture
}

/// Soft-then-hard termination: ask politely, wait the grace period, kill.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
