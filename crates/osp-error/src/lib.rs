// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-error
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Every failure in the control plane is a [`ToolError`]: a machine-readable,
//! stable [`ErrorCode`], a broad [`ErrorKind`] deciding how the error is
//! surfaced over JSON-RPC, a human-readable message, and optional `hint` and
//! `details` payloads for the calling agent.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
///
/// The kind decides the JSON-RPC error code a failure is surfaced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call itself is malformed: bad arguments, unknown action, bad URI.
    InvalidParams,
    /// A named entity (capability, profile, artifact, …) does not exist.
    NotFound,
    /// The operation conflicts with current state (type mismatch, held lock).
    Conflict,
    /// A safety gate refused the operation.
    Denied,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// JSON-RPC error code this kind maps to.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::InvalidParams => -32602,
            Self::NotFound => -32001,
            Self::Conflict => -32002,
            Self::Denied => -32003,
            Self::Internal => -32000,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParams => "invalid_params",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Denied => "denied",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Invalid parameters --
    /// The requested tool action does not exist.
    UnknownAction,
    /// Required inputs are absent after resolution.
    MissingInputs,
    /// An `artifact://` URI (or bare rel path) failed to parse.
    BadUri,
    /// Binary artifact read requested without the export flag.
    ArtifactBase64Blocked,
    /// A state operation named a scope that does not exist.
    StateInvalidScope,
    /// A capability record failed validation.
    CapabilityInvalid,
    /// A runbook definition failed validation.
    RunbookInvalid,
    /// A runbook step attempted to invoke the runbook tool itself.
    RunbookNested,
    /// A template placeholder path did not resolve.
    TemplateMissingPath,
    /// `foreach.items` resolved to a non-array value.
    ForeachNotArray,

    // -- Not found --
    /// No tool registered under the requested name.
    UnknownTool,
    /// No capability is registered for the intent type.
    CapabilityNotFound,
    /// Capabilities exist for the intent but none matched the context.
    CapabilityNotMatched,
    /// The named profile does not exist.
    ProfileNotFound,
    /// The artifact path does not exist under the context root.
    ArtifactNotFound,
    /// The named runbook does not exist.
    RunbookNotFound,
    /// The job id is unknown (or the record expired).
    JobNotFound,

    // -- Conflict --
    /// The profile exists with a different type than requested.
    ProfileTypeMismatch,
    /// Another trace holds the advisory lock for this target.
    PolicyLockHeld,

    // -- Denied --
    /// A write/mixed plan was executed without `apply: true`.
    ApplyRequired,
    /// The git remote is not in the target's allowlist.
    PolicyRemoteDenied,
    /// The current time falls outside every change window.
    PolicyWindowDenied,
    /// The artifact store has no configured context root.
    ArtifactsUnavailable,
    /// Secret export is disabled in this environment.
    SecretExportDisabled,
    /// A resolved path escapes the repository root.
    EscapesRepoRoot,
    /// The command is not in the runner allowlist.
    CommandNotAllowed,
    /// The command or its arguments smuggle a shell interpreter.
    ShellRejected,
    /// No recent plan artifact exists for this trace.
    PlanEvidenceMissing,
    /// The tool is an out-of-process collaborator not wired into this build.
    ExternalToolUnavailable,

    // -- Internal --
    /// Authenticated decryption failed (bad key, tag, or blob shape).
    DecryptFailed,
    /// Capability `depends_on` edges form a cycle.
    CapabilityDepCycle,
    /// The policy service could not be consulted.
    PolicyServiceUnavailable,
    /// A retry loop exhausted its attempts.
    RetryExhausted,
    /// A retry loop exceeded its cumulative delay budget.
    RetryBudgetExceeded,
    /// An operation exceeded its wall-clock budget.
    Timeout,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorKind`] this code belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownAction
            | Self::MissingInputs
            | Self::BadUri
            | Self::ArtifactBase64Blocked
            | Self::StateInvalidScope
            | Self::CapabilityInvalid
            | Self::RunbookInvalid
            | Self::RunbookNested
            | Self::TemplateMissingPath
            | Self::ForeachNotArray => ErrorKind::InvalidParams,

            Self::UnknownTool
            | Self::CapabilityNotFound
            | Self::CapabilityNotMatched
            | Self::ProfileNotFound
            | Self::ArtifactNotFound
            | Self::RunbookNotFound
            | Self::JobNotFound => ErrorKind::NotFound,

            Self::ProfileTypeMismatch | Self::PolicyLockHeld => ErrorKind::Conflict,

            Self::ApplyRequired
            | Self::PolicyRemoteDenied
            | Self::PolicyWindowDenied
            | Self::ArtifactsUnavailable
            | Self::SecretExportDisabled
            | Self::EscapesRepoRoot
            | Self::CommandNotAllowed
            | Self::ShellRejected
            | Self::PlanEvidenceMissing
            | Self::ExternalToolUnavailable => ErrorKind::Denied,

            Self::DecryptFailed
            | Self::CapabilityDepCycle
            | Self::PolicyServiceUnavailable
            | Self::RetryExhausted
            | Self::RetryBudgetExceeded
            | Self::Timeout
            | Self::Internal => ErrorKind::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"APPLY_REQUIRED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::MissingInputs => "MISSING_INPUTS",
            Self::BadUri => "BAD_URI",
            Self::ArtifactBase64Blocked => "ARTIFACT_BASE64_BLOCKED",
            Self::StateInvalidScope => "STATE_INVALID_SCOPE",
            Self::CapabilityInvalid => "CAPABILITY_INVALID",
            Self::RunbookInvalid => "RUNBOOK_INVALID",
            Self::RunbookNested => "RUNBOOK_NESTED",
            Self::TemplateMissingPath => "TEMPLATE_MISSING_PATH",
            Self::ForeachNotArray => "FOREACH_NOT_ARRAY",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            Self::CapabilityNotMatched => "CAPABILITY_NOT_MATCHED",
            Self::ProfileNotFound => "PROFILE_NOT_FOUND",
            Self::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            Self::RunbookNotFound => "RUNBOOK_NOT_FOUND",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::ProfileTypeMismatch => "PROFILE_TYPE_MISMATCH",
            Self::PolicyLockHeld => "POLICY_LOCK_HELD",
            Self::ApplyRequired => "APPLY_REQUIRED",
            Self::PolicyRemoteDenied => "POLICY_REMOTE_DENIED",
            Self::PolicyWindowDenied => "POLICY_WINDOW_DENIED",
            Self::ArtifactsUnavailable => "ARTIFACTS_UNAVAILABLE",
            Self::SecretExportDisabled => "SECRET_EXPORT_DISABLED",
            Self::EscapesRepoRoot => "ESCAPES_REPO_ROOT",
            Self::CommandNotAllowed => "COMMAND_NOT_ALLOWED",
            Self::ShellRejected => "SHELL_REJECTED",
            Self::PlanEvidenceMissing => "PLAN_EVIDENCE_MISSING",
            Self::ExternalToolUnavailable => "EXTERNAL_TOOL_UNAVAILABLE",
            Self::DecryptFailed => "DECRYPT_FAILED",
            Self::CapabilityDepCycle => "CAPABILITY_DEP_CYCLE",
            Self::PolicyServiceUnavailable => "POLICY_SERVICE_UNAVAILABLE",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::RetryBudgetExceeded => "RETRY_BUDGET_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Structured error surfaced by every tool handler.
///
/// The `kind` is always derived from the `code`, so the two can never
/// disagree on the wire.
///
/// # Builder usage
///
/// ```
/// use osp_error::{ErrorCode, ToolError};
///
/// let err = ToolError::new(ErrorCode::ApplyRequired, "plan has write effects")
///     .with_hint("re-run with apply: true")
///     .with_details(serde_json::json!({"effects": "write"}));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolError {
    /// Broad kind, derived from `code`.
    pub kind: ErrorKind,
    /// Machine-readable stable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Suggested remediation for the calling agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Arbitrary structured context for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: code.kind(),
            code,
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    /// Attach a remediation hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach structured diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the details are silently skipped.
    #[must_use]
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    /// Shorthand constructor for internal errors.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Shorthand for `self.code.kind().jsonrpc_code()`.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        self.kind.jsonrpc_code()
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("json error: {err}"))
    }
}

/// Convenience alias used across the workspace.
pub type ToolResult<T> = Result<T, ToolError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
