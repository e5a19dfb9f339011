// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-artifact
#![deny(unsafe_code)]
//!
//! The store is rooted at `SF_CONTEXT_REPO_ROOT/artifacts`. Without a
//! configured root the store is unavailable: writes are silently skipped so
//! hot paths never fail on missing observability, reads fail with
//! `ARTIFACTS_UNAVAILABLE`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_secure::sha256_hex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Environment variable configuring the context repository root.
pub const ENV_CONTEXT_ROOT: &str = "SF_CONTEXT_REPO_ROOT";
/// Environment flag allowing base64 (opaque) artifact export.
pub const ENV_ALLOW_SECRET_EXPORT: &str = "SF_ALLOW_SECRET_EXPORT";

/// Default window for bounded reads.
pub const DEFAULT_READ_BYTES: usize = 64 * 1024;
/// Hard cap for a single bounded read.
pub const MAX_READ_BYTES: usize = 10 * 1024 * 1024;
/// Default number of `list` entries.
pub const DEFAULT_LIST_LIMIT: usize = 200;
/// Hard cap on `list` entries.
pub const MAX_LIST_LIMIT: usize = 2000;

const MAX_FILENAME_LEN: usize = 120;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Stable URI of the form `artifact://<rel>`.
    pub uri: String,
    /// Path relative to the artifacts root.
    pub rel: String,
    /// Size of the stored file in bytes.
    pub bytes: u64,
    /// Hex SHA-256 of the stored content.
    pub sha256: String,
    /// `true` when the stored content is a truncated capture of a larger value.
    pub truncated: bool,
}

/// Result of a bounded read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRead {
    /// Stable URI of the artifact.
    pub uri: String,
    /// Path relative to the artifacts root.
    pub rel: String,
    /// Total size of the file in bytes.
    pub bytes: u64,
    /// Offset of the returned window.
    pub offset: u64,
    /// Length of the returned window.
    pub length: u64,
    /// Hex SHA-256 of the whole file.
    pub sha256: String,
    /// `true` when bytes beyond the returned window exist.
    pub truncated: bool,
    /// UTF-8 content (lossy), present unless base64 was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Base64 content, present when base64 was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
}

/// A `list` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Stable URI of the artifact.
    pub uri: String,
    /// Path relative to the artifacts root.
    pub rel: String,
    /// File size in bytes.
    pub bytes: u64,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
}

/// Requested encoding for artifact content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadEncoding {
    /// Lossy UTF-8 text (default).
    #[default]
    Utf8,
    /// Raw bytes as base64; gated behind the export flag.
    Base64,
}

/// Sandboxed artifact store under a context root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    artifacts_root: Option<PathBuf>,
}

impl ArtifactStore {
    /// Build a store from `SF_CONTEXT_REPO_ROOT`; unset means unavailable.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var_os(ENV_CONTEXT_ROOT)
            .filter(|v| !v.is_empty())
            .map(|v| PathBuf::from(v).join("artifacts"));
        Self {
            artifacts_root: root,
        }
    }

    /// Build a store rooted at an explicit context root.
    pub fn rooted_at(context_root: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_root: Some(context_root.into().join("artifacts")),
        }
    }

    /// A store with no root: writes skipped, reads unavailable.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            artifacts_root: None,
        }
    }

    /// Whether the store has a configured root.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.artifacts_root.is_some()
    }

    /// Write a spill file under `runs/<trace>/tool_calls/<span>/<filename>`.
    ///
    /// Returns `Ok(None)` when the store is unavailable. The filename is
    /// sanitized to `[A-Za-z0-9._-]`, clamped to 120 chars, and collisions
    /// are disambiguated with a numeric suffix.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the file cannot be written.
    pub fn write(
        &self,
        trace_id: &str,
        span_id: &str,
        filename: &str,
        content: &[u8],
    ) -> ToolResult<Option<ArtifactRef>> {
        let Some(root) = &self.artifacts_root else {
            return Ok(None);
        };
        let rel_dir = format!(
            "runs/{}/tool_calls/{}",
            sanitize_component(trace_id),
            sanitize_component(span_id)
        );
        let name = sanitize_filename(filename);
        let dir = root.join(&rel_dir);

        // Disambiguate collisions deterministically within a call.
        let mut candidate = name.clone();
        let mut counter = 1usize;
        while dir.join(&candidate).exists() {
            candidate = disambiguate(&name, counter);
            counter += 1;
        }

        let path = dir.join(&candidate);
        osp_paths::atomic_write(&path, content)
            .map_err(|e| ToolError::internal(format!("write artifact: {e}")))?;

        let rel = format!("{rel_dir}/{candidate}");
        Ok(Some(ArtifactRef {
            uri: format!("artifact://{rel}"),
            rel,
            bytes: content.len() as u64,
            sha256: sha256_hex(content),
            truncated: false,
        }))
    }

    /// Read an arbitrary window of an artifact.
    ///
    /// # Errors
    ///
    /// `ARTIFACTS_UNAVAILABLE` without a root, `BAD_URI` on traversal,
    /// `ARTIFACT_NOT_FOUND` when missing, `ARTIFACT_BASE64_BLOCKED` when
    /// base64 is requested without the export flag.
    pub fn get(
        &self,
        input: &str,
        offset: u64,
        max_bytes: Option<usize>,
        encoding: ReadEncoding,
    ) -> ToolResult<ArtifactRead> {
        let (path, rel) = self.resolve(input)?;
        let data = std::fs::read(&path)
            .map_err(|e| ToolError::internal(format!("read artifact {rel}: {e}")))?;
        let window = clamp_window(max_bytes);
        let total = data.len() as u64;
        let start = offset.min(total) as usize;
        let end = start.saturating_add(window).min(data.len());
        let slice = &data[start..end];
        self.build_read(rel, total, start as u64, slice, &data, encoding, {
            (start as u64) + (slice.len() as u64) < total
        })
    }

    /// Read a prefix slice of an artifact.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`get`](Self::get).
    pub fn head(
        &self,
        input: &str,
        max_bytes: Option<usize>,
        encoding: ReadEncoding,
    ) -> ToolResult<ArtifactRead> {
        self.get(input, 0, max_bytes, encoding)
    }

    /// Read a suffix slice of an artifact.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`get`](Self::get).
    pub fn tail(
        &self,
        input: &str,
        max_bytes: Option<usize>,
        encoding: ReadEncoding,
    ) -> ToolResult<ArtifactRead> {
        let (path, rel) = self.resolve(input)?;
        let data = std::fs::read(&path)
            .map_err(|e| ToolError::internal(format!("read artifact {rel}: {e}")))?;
        let window = clamp_window(max_bytes);
        let total = data.len() as u64;
        let start = data.len().saturating_sub(window);
        let slice = &data[start..];
        let truncated = (slice.len() as u64) < total;
        self.build_read(rel, total, start as u64, slice, &data, encoding, truncated)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_read(
        &self,
        rel: String,
        total: u64,
        offset: u64,
        slice: &[u8],
        whole: &[u8],
        encoding: ReadEncoding,
        truncated: bool,
    ) -> ToolResult<ArtifactRead> {
        let (content, content_base64) = match encoding {
            ReadEncoding::Utf8 => (Some(String::from_utf8_lossy(slice).into_owned()), None),
            ReadEncoding::Base64 => {
                if !osp_paths::env_truthy(ENV_ALLOW_SECRET_EXPORT) {
                    return Err(ToolError::new(
                        ErrorCode::ArtifactBase64Blocked,
                        "base64 artifact export is disabled",
                    )
                    .with_hint(format!("set {ENV_ALLOW_SECRET_EXPORT}=1 to allow")));
                }
                (None, Some(BASE64.encode(slice)))
            }
        };
        Ok(ArtifactRead {
            uri: format!("artifact://{rel}"),
            rel,
            bytes: total,
            offset,
            length: slice.len() as u64,
            sha256: sha256_hex(whole),
            truncated,
            content,
            content_base64,
        })
    }

    /// Recursively list artifacts under `prefix`, capped at `limit`.
    ///
    /// # Errors
    ///
    /// `ARTIFACTS_UNAVAILABLE` without a root, `BAD_URI` on traversal.
    pub fn list(&self, prefix: &str, limit: Option<usize>) -> ToolResult<Vec<ArtifactEntry>> {
        let root = self.require_root()?;
        let rel_prefix = normalize_rel(strip_uri(prefix))?;
        let base = root.join(&rel_prefix);
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT)
            .max(1);

        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| ToolError::internal(format!("walk artifacts: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| ToolError::internal("artifact outside root during walk"))?
                .to_string_lossy()
                .replace('\\', "/");
            let meta = entry
                .metadata()
                .map_err(|e| ToolError::internal(format!("stat artifact: {e}")))?;
            let mtime: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(ArtifactEntry {
                uri: format!("artifact://{rel}"),
                rel,
                bytes: meta.len(),
                mtime,
            });
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Resolve a URI or bare rel path to an on-disk file, enforcing the
    /// sandbox. Returns the canonical path and the normalized rel.
    fn resolve(&self, input: &str) -> ToolResult<(PathBuf, String)> {
        let root = self.require_root()?;
        let rel = normalize_rel(strip_uri(input))?;
        if rel.is_empty() {
            return Err(ToolError::new(ErrorCode::BadUri, "empty artifact path"));
        }
        let joined = root.join(&rel);
        let canonical = joined.canonicalize().map_err(|_| {
            ToolError::new(
                ErrorCode::ArtifactNotFound,
                format!("artifact '{rel}' not found"),
            )
        })?;
        let canonical_root = root
            .canonicalize()
            .map_err(|e| ToolError::internal(format!("canonicalize artifacts root: {e}")))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(ToolError::new(
                ErrorCode::BadUri,
                format!("artifact path '{rel}' escapes the artifacts root"),
            ));
        }
        Ok((canonical, rel))
    }

    fn require_root(&self) -> ToolResult<&PathBuf> {
        self.artifacts_root.as_ref().ok_or_else(|| {
            ToolError::new(
                ErrorCode::ArtifactsUnavailable,
                "no context root configured",
            )
            .with_hint(format!("set {ENV_CONTEXT_ROOT} to enable artifacts"))
        })
    }
}

fn clamp_window(max_bytes: Option<usize>) -> usize {
    max_bytes.unwrap_or(DEFAULT_READ_BYTES).min(MAX_READ_BYTES)
}

fn strip_uri(input: &str) -> &str {
    input.strip_prefix("artifact://").unwrap_or(input)
}

/// Lexically normalize a rel path: forward slashes, no empty/`.` segments,
/// and reject absolute paths and any `..` component outright.
fn normalize_rel(input: &str) -> ToolResult<String> {
    let path = Path::new(input);
    if path.is_absolute() {
        return Err(ToolError::new(
            ErrorCode::BadUri,
            "absolute artifact paths are not allowed",
        ));
    }
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ToolError::new(
                    ErrorCode::BadUri,
                    "'..' is not allowed in artifact paths",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::new(
                    ErrorCode::BadUri,
                    "absolute artifact paths are not allowed",
                ));
            }
        }
    }
    Ok(parts.join("/"))
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn sanitize_filename(raw: &str) -> String {
    let mut cleaned = sanitize_component(raw);
    if cleaned.len() > MAX_FILENAME_LEN {
        cleaned.truncate(MAX_FILENAME_LEN);
    }
    // Dotfiles would vanish from casual listings; keep names visible.
    if cleaned.starts_with('.') {
        cleaned.insert(0, '_');
        cleaned.truncate(MAX_FILENAME_LEN);
    }
    cleaned
}

fn disambiguate(name: &str, counter: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{counter}.{ext}"),
        _ => format!("{name}-{counter}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
