// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded TTL registry of background job records.
//!
//! Ring-buffer semantics: the oldest record is evicted when capacity is
//! exceeded, expired records are purged opportunistically, and an evicted
//! record never resurfaces. A file-backed store persists snapshots through
//! a debounced flusher task so bursts of updates coalesce into one rewrite.

use chrono::{DateTime, Duration, Utc};
use osp_error::{ErrorCode, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default capacity of the ring buffer.
pub const DEFAULT_MAX_JOBS: usize = 500;
/// Default record TTL.
pub const DEFAULT_TTL_MS: u64 = 6 * 60 * 60 * 1000;
/// Debounce window for file-backed persistence.
pub const FLUSH_DEBOUNCE_MS: u64 = 50;

/// Lifecycle state of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet started.
    Queued,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Stopped before completion.
    Canceled,
}

impl JobStatus {
    /// Parse a status name; unknown names return `None` (callers normalize).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether the job has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// One tracked background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job id.
    pub job_id: String,
    /// Job kind, e.g. `repo.exec`.
    pub kind: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Trace the job belongs to.
    pub trace_id: String,
    /// Span that detached the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Expiry instant; the record is purged after this.
    pub expires_at: DateTime<Utc>,
    /// Free-form progress payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    /// Artifact references produced by the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    /// Provider tag, e.g. `ssh`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Error payload for failed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Patch applied by [`JobStore::upsert`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Raw status name; unknown values normalize to the existing status.
    pub status: Option<String>,
    /// New progress payload.
    pub progress: Option<Value>,
    /// New artifacts payload.
    pub artifacts: Option<Value>,
    /// New error payload.
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    jobs: Vec<JobRecord>,
}

/// Bounded TTL job registry, optionally file-backed.
pub struct JobStore {
    max_jobs: usize,
    ttl: Duration,
    path: Option<PathBuf>,
    jobs: Mutex<VecDeque<JobRecord>>,
    dirty: AtomicBool,
    flush_signal: Notify,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("max_jobs", &self.max_jobs)
            .field("path", &self.path)
            .finish()
    }
}

impl JobStore {
    /// In-memory store with the given capacity and TTL.
    #[must_use]
    pub fn in_memory(max_jobs: usize, ttl_ms: u64) -> Self {
        Self {
            max_jobs: max_jobs.max(1),
            ttl: Duration::milliseconds(ttl_ms as i64),
            path: None,
            jobs: Mutex::new(VecDeque::new()),
            dirty: AtomicBool::new(false),
            flush_signal: Notify::new(),
        }
    }

    /// File-backed store; loads surviving records from `jobs.json`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if an existing file cannot be parsed.
    pub fn file_backed(path: impl Into<PathBuf>, max_jobs: usize, ttl_ms: u64) -> ToolResult<Self> {
        let path = path.into();
        let mut store = Self::in_memory(max_jobs, ttl_ms);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if !text.trim().is_empty() {
                let file: JobsFile = serde_json::from_str(&text)
                    .map_err(|e| ToolError::internal(format!("parse {}: {e}", path.display())))?;
                let now = Utc::now();
                let jobs = store.jobs.get_mut().expect("jobs lock poisoned");
                jobs.extend(file.jobs.into_iter().filter(|j| j.expires_at > now));
            }
        }
        store.path = Some(path);
        Ok(store)
    }

    /// Spawn the debounced flusher for a file-backed store. Mutations only
    /// mark the store dirty; this task coalesces them into atomic rewrites.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.flush_signal.notified().await;
                tokio::time::sleep(std::time::Duration::from_millis(FLUSH_DEBOUNCE_MS)).await;
                if let Err(err) = store.flush() {
                    tracing::warn!(target: "osp.jobs", %err, "job snapshot flush failed");
                }
            }
        })
    }

    /// Create a new queued job and return its record.
    pub fn create(
        &self,
        kind: &str,
        trace_id: &str,
        parent_span_id: Option<&str>,
        provider: Option<&str>,
    ) -> JobRecord {
        let now = Utc::now();
        let record = JobRecord {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            status: JobStatus::Queued,
            trace_id: trace_id.to_string(),
            parent_span_id: parent_span_id.map(str::to_owned),
            created_at: now,
            started_at: None,
            updated_at: now,
            ended_at: None,
            expires_at: now + self.ttl,
            progress: None,
            artifacts: None,
            provider: provider.map(str::to_owned),
            error: None,
        };
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        purge_expired(&mut jobs, now);
        jobs.push_back(record.clone());
        while jobs.len() > self.max_jobs {
            jobs.pop_front();
        }
        drop(jobs);
        self.mark_dirty();
        record
    }

    /// Apply a patch to an existing job.
    ///
    /// Unknown status names normalize to the existing status. Transitions
    /// into a terminal state stamp `ended_at`; entering `running` stamps
    /// `started_at`.
    ///
    /// # Errors
    ///
    /// `JOB_NOT_FOUND` when the id is unknown or the record expired.
    pub fn upsert(&self, job_id: &str, patch: JobPatch) -> ToolResult<JobRecord> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        let now = Utc::now();
        purge_expired(&mut jobs, now);
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| not_found(job_id))?;

        if let Some(raw) = &patch.status {
            let next = JobStatus::parse(raw).unwrap_or(job.status);
            if next == JobStatus::Running && job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if next.is_terminal() && !job.status.is_terminal() {
                job.ended_at = Some(now);
            }
            job.status = next;
        }
        if let Some(progress) = patch.progress {
            job.progress = Some(progress);
        }
        if let Some(artifacts) = patch.artifacts {
            job.artifacts = Some(artifacts);
        }
        if let Some(error) = patch.error {
            job.error = Some(error);
        }
        job.updated_at = now;
        let updated = job.clone();
        drop(jobs);
        self.mark_dirty();
        Ok(updated)
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// `JOB_NOT_FOUND` when unknown or expired.
    pub fn get(&self, job_id: &str) -> ToolResult<JobRecord> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        purge_expired(&mut jobs, Utc::now());
        jobs.iter()
            .find(|j| j.job_id == job_id)
            .cloned()
            .ok_or_else(|| not_found(job_id))
    }

    /// List jobs, newest first, optionally filtered by status.
    #[must_use]
    pub fn list(&self, limit: Option<usize>, status: Option<JobStatus>) -> Vec<JobRecord> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        purge_expired(&mut jobs, Utc::now());
        jobs.iter()
            .rev()
            .filter(|j| status.is_none_or(|s| s == j.status))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop a job record.
    ///
    /// # Errors
    ///
    /// `JOB_NOT_FOUND` when unknown.
    pub fn forget(&self, job_id: &str) -> ToolResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        let before = jobs.len();
        jobs.retain(|j| j.job_id != job_id);
        if jobs.len() == before {
            return Err(not_found(job_id));
        }
        drop(jobs);
        self.mark_dirty();
        Ok(())
    }

    /// Write the current snapshot now, bypassing the debounce.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the snapshot cannot be written.
    pub fn flush(&self) -> ToolResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = {
            let jobs = self.jobs.lock().expect("jobs lock poisoned");
            JobsFile {
                version: 1,
                jobs: jobs.iter().cloned().collect(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        osp_paths::atomic_write(path, &json)
            .map_err(|e| ToolError::internal(format!("persist jobs: {e}")))
    }

    fn mark_dirty(&self) {
        if self.path.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
            self.flush_signal.notify_one();
        }
    }
}

fn purge_expired(jobs: &mut VecDeque<JobRecord>, now: DateTime<Utc>) {
    jobs.retain(|j| j.expires_at > now);
}

fn not_found(job_id: &str) -> ToolError {
    ToolError::new(ErrorCode::JobNotFound, format!("job '{job_id}' not found"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_roundtrip() {
        let store = JobStore::in_memory(10, 60_000);
        let job = store.create("repo.exec", "t-1", Some("s-1"), None);
        assert_eq!(job.status, JobStatus::Queued);
        let fetched = store.get(&job.job_id).unwrap();
        assert_eq!(fetched.kind, "repo.exec");
        assert_eq!(fetched.trace_id, "t-1");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = JobStore::in_memory(3, 60_000);
        let first = store.create("a", "t", None, None);
        for i in 0..3 {
            store.create(&format!("b{i}"), "t", None, None);
        }
        assert_eq!(store.list(None, None).len(), 3);
        let err = store.get(&first.job_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);
    }

    #[test]
    fn expired_records_are_purged() {
        let store = JobStore::in_memory(10, 0);
        let job = store.create("a", "t", None, None);
        let err = store.get(&job.job_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);
        assert!(store.list(None, None).is_empty());
    }

    #[test]
    fn upsert_transitions_stamp_times() {
        let store = JobStore::in_memory(10, 60_000);
        let job = store.create("a", "t", None, None);
        let running = store
            .upsert(
                &job.job_id,
                JobPatch {
                    status: Some("running".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.ended_at.is_none());

        let done = store
            .upsert(
                &job.job_id,
                JobPatch {
                    status: Some("succeeded".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert!(done.ended_at.is_some());
    }

    #[test]
    fn unknown_status_normalizes_to_existing() {
        let store = JobStore::in_memory(10, 60_000);
        let job = store.create("a", "t", None, None);
        let after = store
            .upsert(
                &job.job_id,
                JobPatch {
                    status: Some("exploded".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert_eq!(after.status, JobStatus::Queued);
    }

    #[test]
    fn list_filters_by_status_newest_first() {
        let store = JobStore::in_memory(10, 60_000);
        let a = store.create("a", "t", None, None);
        let _b = store.create("b", "t", None, None);
        store
            .upsert(
                &a.job_id,
                JobPatch {
                    status: Some("failed".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        let failed = store.list(None, Some(JobStatus::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, a.job_id);
        let all = store.list(Some(1), None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, "b");
    }

    #[test]
    fn forget_removes_record() {
        let store = JobStore::in_memory(10, 60_000);
        let job = store.create("a", "t", None, None);
        store.forget(&job.job_id).unwrap();
        assert_eq!(store.forget(&job.job_id).unwrap_err().code, ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn file_backed_snapshot_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.json");
        let store = JobStore::file_backed(&path, 10, 60_000).unwrap();
        let job = store.create("a", "t", None, Some("ssh"));
        store.flush().unwrap();

        let reloaded = JobStore::file_backed(&path, 10, 60_000).unwrap();
        let fetched = reloaded.get(&job.job_id).unwrap();
        assert_eq!(fetched.provider.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn flusher_coalesces_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.json");
        let store = Arc::new(JobStore::file_backed(&path, 10, 60_000).unwrap());
        let flusher = store.spawn_flusher();
        for i in 0..5 {
            store.create(&format!("k{i}"), "t", None, None);
        }
        tokio::time::sleep(std::time::Duration::from_millis(FLUSH_DEBOUNCE_MS * 4)).await;
        assert!(path.exists());
        let reloaded = JobStore::file_backed(&path, 10, 60_000).unwrap();
        assert_eq!(reloaded.list(None, None).len(), 5);
        flusher.abort();
    }
}
