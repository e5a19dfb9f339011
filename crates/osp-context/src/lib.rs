// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-context
#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use osp_error::{ToolError, ToolResult};
use osp_store::{NamedStore, Project};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Maximum directory levels walked upward when probing for a git root.
const GIT_WALK_LEVELS: usize = 25;

/// Marker rules: tag → any-of marker paths relative to the detected root.
const MARKER_RULES: &[(&str, &[&str])] = &[
    (
        "node",
        &[
            "package.json",
            "yarn.lock",
            "pnpm-lock.yaml",
            "package-lock.json",
        ],
    ),
    (
        "python",
        &["pyproject.toml", "requirements.txt", "setup.py", "Pipfile"],
    ),
    ("go", &["go.mod", "go.sum"]),
    ("rust", &["Cargo.toml"]),
    (
        "docker",
        &[
            "Dockerfile",
            "docker-compose.yml",
            "docker-compose.yaml",
            "compose.yaml",
        ],
    ),
    ("k8s", &["k8s", "manifests", "deploy/kubernetes"]),
    ("helm", &["Chart.yaml", "charts"]),
    ("kustomize", &["kustomization.yaml", "kustomization.yml"]),
    (
        "argocd",
        &[".argocd", "argocd-application.yaml", "argocd"],
    ),
    (
        "flux",
        &[
            "gotk-components.yaml",
            "flux-system",
            "flux-system/gotk-components.yaml",
        ],
    ),
    ("terraform", &["main.tf", "terraform.tf", ".terraform"]),
    (
        "ci",
        &[
            ".github/workflows",
            ".gitlab-ci.yml",
            "Jenkinsfile",
            ".circleci",
        ],
    ),
];

/// Inputs accepted by [`ContextDetector::get`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextQuery {
    /// Project name resolved through the project registry.
    pub project: Option<String>,
    /// Target name inside the project.
    pub target: Option<String>,
    /// Working directory; defaults to the process cwd.
    pub cwd: Option<String>,
    /// Repository root override.
    pub repo_root: Option<String>,
    /// Bypass the cache and re-derive.
    #[serde(default)]
    pub refresh: bool,
}

/// A derived context record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Cache key: `project:<p>:<t>` or `cwd:<abs>`.
    pub key: String,
    /// Detection root (repo root, git root, or cwd).
    pub root: String,
    /// Working directory the query resolved to.
    pub cwd: String,
    /// Git repository root, when one encloses `cwd`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_root: Option<String>,
    /// Sorted derived tags.
    pub tags: Vec<String>,
    /// Tag → whether any of its markers exist.
    pub signals: BTreeMap<String, bool>,
    /// Marker path → existence.
    pub files: BTreeMap<String, bool>,
    /// When this record was derived.
    pub updated_at: DateTime<Utc>,
}

impl ContextRecord {
    /// Whether the context carries a tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextFile {
    version: u32,
    contexts: BTreeMap<String, ContextRecord>,
}

/// Marker-driven context detector with a persistent cache.
pub struct ContextDetector {
    cache_path: PathBuf,
    projects: Option<Arc<NamedStore<Project>>>,
    cache: Mutex<ContextFile>,
}

impl std::fmt::Debug for ContextDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextDetector")
            .field("cache_path", &self.cache_path)
            .finish()
    }
}

impl ContextDetector {
    /// Open the detector, loading any cached records.
    ///
    /// # Errors
    ///
    /// Returns an internal error if an existing cache cannot be parsed.
    pub fn open(
        cache_path: impl Into<PathBuf>,
        projects: Option<Arc<NamedStore<Project>>>,
    ) -> ToolResult<Self> {
        let cache_path = cache_path.into();
        let cache = match std::fs::read_to_string(&cache_path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                ToolError::internal(format!("parse {}: {e}", cache_path.display()))
            })?,
            _ => ContextFile {
                version: 1,
                contexts: BTreeMap::new(),
            },
        };
        Ok(Self {
            cache_path,
            projects,
            cache: Mutex::new(cache),
        })
    }

    /// Return the context for a query, deriving and caching when needed.
    ///
    /// # Errors
    ///
    /// Fails when the query's directories cannot be resolved or the cache
    /// cannot be persisted.
    pub fn get(&self, query: &ContextQuery) -> ToolResult<ContextRecord> {
        let resolved = self.resolve_query(query)?;
        if !query.refresh {
            let cache = self.cache.lock().expect("context lock poisoned");
            if let Some(record) = cache.contexts.get(&resolved.key) {
                return Ok(record.clone());
            }
        }
        let record = derive(&resolved);
        let mut cache = self.cache.lock().expect("context lock poisoned");
        cache.contexts.insert(record.key.clone(), record.clone());
        let json = serde_json::to_vec_pretty(&*cache)?;
        osp_paths::atomic_write(&self.cache_path, &json)
            .map_err(|e| ToolError::internal(format!("persist context cache: {e}")))?;
        Ok(record)
    }

    fn resolve_query(&self, query: &ContextQuery) -> ToolResult<ResolvedQuery> {
        let mut cwd = query.cwd.clone();
        let mut repo_root = query.repo_root.clone();
        let mut key = None;

        if let Some(project_name) = &query.project {
            let project = self
                .projects
                .as_ref()
                .and_then(|reg| reg.get(project_name));
            if let Some(project) = project {
                if let Some((target_name, target)) = project.target(query.target.as_deref()) {
                    key = Some(format!("project:{project_name}:{target_name}"));
                    cwd = cwd.or_else(|| target.cwd.clone());
                    repo_root = repo_root.or_else(|| target.repo_root.clone());
                }
            }
            if key.is_none() {
                // Unknown project/target still gets a stable key so the
                // caller sees a consistent record.
                let target = query.target.as_deref().unwrap_or("default");
                key = Some(format!("project:{project_name}:{target}"));
            }
        }

        let cwd = match cwd {
            Some(c) => PathBuf::from(c),
            None => std::env::current_dir()
                .map_err(|e| ToolError::internal(format!("resolve cwd: {e}")))?,
        };
        let cwd = cwd.canonicalize().unwrap_or(cwd);
        let key = key.unwrap_or_else(|| format!("cwd:{}", cwd.display()));

        Ok(ResolvedQuery {
            key,
            cwd,
            repo_root: repo_root.map(PathBuf::from),
        })
    }
}

struct ResolvedQuery {
    key: String,
    cwd: PathBuf,
    repo_root: Option<PathBuf>,
}

fn derive(query: &ResolvedQuery) -> ContextRecord {
    let git_root = find_git_root(&query.cwd);
    let root = query
        .repo_root
        .clone()
        .or_else(|| git_root.clone())
        .unwrap_or_else(|| query.cwd.clone());

    let mut signals = BTreeMap::new();
    let mut files = BTreeMap::new();
    for (tag, markers) in MARKER_RULES {
        let mut any = false;
        for marker in *markers {
            let exists = root.join(marker).exists();
            files.insert((*marker).to_string(), exists);
            any |= exists;
        }
        signals.insert((*tag).to_string(), any);
    }

    let mut tags: Vec<String> = signals
        .iter()
        .filter(|(_, on)| **on)
        .map(|(tag, _)| tag.clone())
        .collect();
    if git_root.is_some() {
        tags.push("git".to_string());
    }
    if tags.iter().any(|t| t == "argocd" || t == "flux") {
        tags.push("gitops".to_string());
    }
    tags.sort();
    tags.dedup();

    debug!(target: "osp.context", key = %query.key, ?tags, "derived context");

    ContextRecord {
        key: query.key.clone(),
        root: root.display().to_string(),
        cwd: query.cwd.display().to_string(),
        git_root: git_root.map(|p| p.display().to_string()),
        tags,
        signals,
        files,
        updated_at: Utc::now(),
    }
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..GIT_WALK_LEVELS {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
