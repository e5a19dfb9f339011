// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-policy
#![deny(unsafe_code)]

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use osp_artifact::ArtifactStore;
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_store::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Default advisory-lock TTL (10 minutes).
pub const DEFAULT_LOCK_TTL_MS: u64 = 10 * 60 * 1000;

// ---------------------------------------------------------------------------
// Policy configuration
// ---------------------------------------------------------------------------

/// Git-remote constraints for a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoPolicy {
    /// Remotes a write may push to (normalized comparison).
    #[serde(default)]
    pub allowed_remotes: Vec<String>,
}

/// Kubernetes constraints applied by controller runbooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesPolicy {
    /// Namespaces sync/verify operations may touch.
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
}

/// One wall-clock change window (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeWindow {
    /// Weekday names (`mon` … `sun`); empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    /// Window start, `HH:MM`.
    pub start: String,
    /// Window end, `HH:MM`. An end before the start wraps past midnight.
    pub end: String,
}

/// Advisory-lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Whether the lock is taken at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lock TTL in milliseconds.
    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    DEFAULT_LOCK_TTL_MS
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }
}

/// Full policy block attached to a project target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Git-remote constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoPolicy>,
    /// Kubernetes constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesPolicy>,
    /// Allowed change windows; empty means always allowed.
    #[serde(default)]
    pub change_windows: Vec<ChangeWindow>,
    /// Advisory-lock settings.
    #[serde(default)]
    pub lock: LockPolicy,
}

impl PolicyConfig {
    /// Parse the policy block of a project target. `None` yields defaults;
    /// a malformed block fails closed.
    ///
    /// # Errors
    ///
    /// `POLICY_SERVICE_UNAVAILABLE` when the block cannot be parsed.
    pub fn from_value(value: Option<&Value>) -> ToolResult<Self> {
        match value {
            None => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
                ToolError::new(
                    ErrorCode::PolicyServiceUnavailable,
                    format!("malformed policy block: {e}"),
                )
            }),
        }
    }

    /// Check a git remote against the allowlist.
    ///
    /// An absent repo policy (or empty allowlist) imposes no constraint.
    ///
    /// # Errors
    ///
    /// `POLICY_REMOTE_DENIED` when an allowlist exists and the remote is
    /// not on it.
    pub fn check_remote(&self, remote: &str) -> ToolResult<()> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };
        if repo.allowed_remotes.is_empty() {
            return Ok(());
        }
        let normalized = normalize_remote(remote);
        if repo
            .allowed_remotes
            .iter()
            .any(|allowed| normalize_remote(allowed) == normalized)
        {
            return Ok(());
        }
        Err(ToolError::new(
            ErrorCode::PolicyRemoteDenied,
            format!("remote '{remote}' is not in the target's allowlist"),
        )
        .with_hint("add the remote to policy.repo.allowed_remotes or push elsewhere"))
    }

    /// Check the current instant against the change windows.
    ///
    /// # Errors
    ///
    /// `POLICY_WINDOW_DENIED` when windows are configured and `now` falls
    /// outside all of them.
    pub fn check_window(&self, now: DateTime<Utc>) -> ToolResult<()> {
        if self.change_windows.is_empty() {
            return Ok(());
        }
        for window in &self.change_windows {
            if window_contains(window, now)? {
                return Ok(());
            }
        }
        Err(ToolError::new(
            ErrorCode::PolicyWindowDenied,
            format!("no change window is open at {}", now.to_rfc3339()),
        )
        .with_hint("wait for a configured change window or adjust policy.change_windows"))
    }
}

/// Normalize a git remote URL for allowlist comparison.
///
/// Strips the scheme, `git@host:` form, userinfo, a trailing `.git`, and
/// trailing slashes, then lowercases: `git@github.com:Org/Repo.git` and
/// `https://github.com/org/repo` compare equal.
#[must_use]
pub fn normalize_remote(remote: &str) -> String {
    let mut rest = remote.trim();
    for scheme in ["ssh://", "https://", "http://", "git://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    // scp-like form: git@host:path
    let rest = match rest.split_once('@') {
        Some((_user, host_path)) => host_path.replacen(':', "/", 1),
        None => rest.to_string(),
    };
    rest.trim_end_matches('/')
        .trim_end_matches(".git")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

fn window_contains(window: &ChangeWindow, now: DateTime<Utc>) -> ToolResult<bool> {
    if !window.days.is_empty() {
        let today = weekday_name(now.weekday());
        if !window.days.iter().any(|d| d.eq_ignore_ascii_case(today)) {
            return Ok(false);
        }
    }
    let start = parse_hhmm(&window.start)?;
    let end = parse_hhmm(&window.end)?;
    let time = now.time();
    let inside = if start <= end {
        time >= start && time < end
    } else {
        // Wraps past midnight.
        time >= start || time < end
    };
    Ok(inside)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn parse_hhmm(raw: &str) -> ToolResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| {
        ToolError::new(
            ErrorCode::PolicyServiceUnavailable,
            format!("invalid change-window time '{raw}' (expected HH:MM)"),
        )
    })
}

// ---------------------------------------------------------------------------
// Advisory lock guard
// ---------------------------------------------------------------------------

/// RAII guard for the per-`(project, target)` advisory lock.
///
/// Dropping the guard releases the lock, so every exit path — success,
/// error, panic unwind — gives it back.
pub struct PolicyGuard {
    state: Arc<StateStore>,
    key: Option<String>,
    holder: String,
}

impl std::fmt::Debug for PolicyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}

impl PolicyGuard {
    /// Acquire the advisory lock for `(project, target)` on behalf of
    /// `trace_id`. With the lock disabled by policy this returns a no-op
    /// guard.
    ///
    /// # Errors
    ///
    /// `POLICY_LOCK_HELD` when another trace holds a live lock.
    pub fn acquire(
        state: Arc<StateStore>,
        config: &PolicyConfig,
        project: &str,
        target: &str,
        trace_id: &str,
    ) -> ToolResult<Self> {
        if !config.lock.enabled {
            return Ok(Self {
                state,
                key: None,
                holder: trace_id.to_string(),
            });
        }
        let key = format!("policy.lock.{project}.{target}");
        state.acquire_lock(&key, trace_id, config.lock.ttl_ms)?;
        debug!(target: "osp.policy", %key, holder = trace_id, "advisory lock acquired");
        Ok(Self {
            state,
            key: Some(key),
            holder: trace_id.to_string(),
        })
    }
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.state.release_lock(&key, &self.holder);
            debug!(target: "osp.policy", %key, holder = %self.holder, "advisory lock released");
        }
    }
}

// ---------------------------------------------------------------------------
// Plan evidence
// ---------------------------------------------------------------------------

/// Verify a recent plan artifact exists for `trace_id` before a sync or
/// rollback executes (diff-before-apply).
///
/// # Errors
///
/// `PLAN_EVIDENCE_MISSING` when no plan artifact is found and the override
/// flag is unset.
pub fn check_plan_evidence(
    artifacts: &ArtifactStore,
    trace_id: &str,
    override_flag: bool,
) -> ToolResult<()> {
    if override_flag {
        return Ok(());
    }
    let prefix = format!("runs/{trace_id}");
    let entries = artifacts.list(&prefix, None).unwrap_or_default();
    if entries.iter().any(|e| e.rel.contains("plan")) {
        return Ok(());
    }
    Err(ToolError::new(
        ErrorCode::PlanEvidenceMissing,
        format!("no plan artifact found for trace {trace_id}"),
    )
    .with_hint("run gitops.plan first, or pass skip_plan_check: true to override"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
