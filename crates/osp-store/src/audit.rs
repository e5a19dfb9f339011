// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only JSONL audit log.
//!
//! Appends are serialized through one internal lock so entries land in
//! wall-clock order. Inputs must already be redacted by the caller; the log
//! never inspects payloads.

use chrono::{DateTime, Utc};
use osp_error::{ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;

/// Outcome recorded for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// The call returned a result.
    Ok,
    /// The call surfaced an error.
    Error,
}

/// One line of `audit.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the call finished.
    pub timestamp: DateTime<Utc>,
    /// Call outcome.
    pub status: AuditStatus,
    /// Canonical tool name.
    pub tool: String,
    /// Tool action.
    pub action: String,
    /// Trace correlation id.
    pub trace_id: String,
    /// Span id of this call.
    pub span_id: String,
    /// Parent span, when nested under another call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Alias the caller used, when different from `tool`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoked_as: Option<String>,
    /// Redacted input snapshot.
    pub input: Value,
    /// Result summary (type + truncated preview).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
}

/// Filter for streamed reads.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Maximum entries returned (tail; default 100).
    pub limit: Option<usize>,
    /// Only entries for this canonical tool.
    pub tool: Option<String>,
    /// Only entries with this status.
    pub status: Option<AuditStatus>,
    /// Only entries with this trace id.
    pub trace_id: Option<String>,
}

const DEFAULT_READ_LIMIT: usize = 100;
const MAX_READ_LIMIT: usize = 1000;

/// Append-only audit log backed by one JSONL file.
pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    /// Open (or lazily create) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// Append one entry. Fires on success and error paths alike.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the line cannot be written.
    pub fn append(&self, entry: &AuditEntry) -> ToolResult<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.append_lock.lock().expect("audit lock poisoned");
        osp_paths::append_line(&self.path, &line)
            .map_err(|e| ToolError::internal(format!("append audit entry: {e}")))
    }

    /// Read the filtered tail of the log (newest entries last).
    ///
    /// Unparseable lines are skipped rather than failing the read; the log
    /// must stay readable even if a crash left a torn line.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the file exists but cannot be read.
    pub fn read(&self, filter: &AuditFilter) -> ToolResult<Vec<AuditEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ToolError::internal(format!("read audit log: {e}"))),
        };
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_READ_LIMIT)
            .min(MAX_READ_LIMIT)
            .max(1);

        let matched: Vec<AuditEntry> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
            .filter(|e| filter.tool.as_deref().is_none_or(|t| t == e.tool))
            .filter(|e| filter.status.is_none_or(|s| s == e.status))
            .filter(|e| filter.trace_id.as_deref().is_none_or(|t| t == e.trace_id))
            .collect();

        let skip = matched.len().saturating_sub(limit);
        Ok(matched.into_iter().skip(skip).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(tool: &str, status: AuditStatus, trace: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            status,
            tool: tool.to_string(),
            action: "run".to_string(),
            trace_id: trace.to_string(),
            span_id: "s-1".to_string(),
            parent_span_id: None,
            invoked_as: None,
            input: json!({"arg": 1}),
            result_summary: None,
            error: None,
            duration_ms: 5,
        }
    }

    #[test]
    fn append_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("audit.jsonl"));
        log.append(&entry("mcp_repo", AuditStatus::Ok, "t-1")).unwrap();
        log.append(&entry("mcp_state", AuditStatus::Error, "t-1")).unwrap();
        let all = log.read(&AuditFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tool, "mcp_repo");
        assert_eq!(all[1].status, AuditStatus::Error);
    }

    #[test]
    fn filters_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("audit.jsonl"));
        log.append(&entry("mcp_repo", AuditStatus::Ok, "t-1")).unwrap();
        log.append(&entry("mcp_repo", AuditStatus::Error, "t-2")).unwrap();
        log.append(&entry("mcp_state", AuditStatus::Ok, "t-2")).unwrap();

        let by_tool = log
            .read(&AuditFilter {
                tool: Some("mcp_repo".into()),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(by_tool.len(), 2);

        let by_status = log
            .read(&AuditFilter {
                status: Some(AuditStatus::Error),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].trace_id, "t-2");

        let by_trace = log
            .read(&AuditFilter {
                trace_id: Some("t-2".into()),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(by_trace.len(), 2);
    }

    #[test]
    fn limit_keeps_the_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("audit.jsonl"));
        for i in 0..10 {
            log.append(&entry(&format!("tool-{i}"), AuditStatus::Ok, "t")).unwrap();
        }
        let tail = log
            .read(&AuditFilter {
                limit: Some(3),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].tool, "tool-7");
        assert_eq!(tail[2].tool, "tool-9");
    }

    #[test]
    fn missing_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("missing.jsonl"));
        assert!(log.read(&AuditFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn torn_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let log = AuditLog::open(&path);
        log.append(&entry("a", AuditStatus::Ok, "t")).unwrap();
        osp_paths::append_line(&path, "{\"torn\":").unwrap();
        log.append(&entry("b", AuditStatus::Ok, "t")).unwrap();
        let all = log.read(&AuditFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }
}
