// SPDX-License-Identifier: MIT OR Apache-2.0
//! Named JSON-object registries.
//!
//! `projects.json`, `runbooks.json`, `aliases.json`, and `presets.json` all
//! share the same shape — a JSON object keyed by name — so they share one
//! file-backed store generic over the record type.

use osp_error::{ToolError, ToolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Generic file-backed registry: one JSON object keyed by record name.
pub struct NamedStore<T> {
    path: PathBuf,
    records: Mutex<BTreeMap<String, T>>,
}

impl<T> std::fmt::Debug for NamedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedStore").field("path", &self.path).finish()
    }
}

impl<T: Serialize + DeserializeOwned + Clone> NamedStore<T> {
    /// Open the registry, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns an internal error if an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> ToolResult<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| ToolError::internal(format!("parse {}: {e}", path.display())))?,
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Look up a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<T> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Insert or replace a record, persisting atomically.
    ///
    /// # Errors
    ///
    /// Returns an internal error on persist failure.
    pub fn set(&self, name: &str, record: T) -> ToolResult<()> {
        let mut records = self.records.lock().expect("registry lock poisoned");
        records.insert(name.to_string(), record);
        self.persist(&records)
    }

    /// Remove a record; returns `true` when it existed.
    ///
    /// # Errors
    ///
    /// Returns an internal error on persist failure.
    pub fn delete(&self, name: &str) -> ToolResult<bool> {
        let mut records = self.records.lock().expect("registry lock poisoned");
        let removed = records.remove(name).is_some();
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    /// Sorted record names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of every record.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, T> {
        self.records.lock().expect("registry lock poisoned").clone()
    }

    /// Replace the whole registry content, persisting atomically.
    ///
    /// # Errors
    ///
    /// Returns an internal error on persist failure.
    pub fn replace_all(&self, new_records: BTreeMap<String, T>) -> ToolResult<()> {
        let mut records = self.records.lock().expect("registry lock poisoned");
        *records = new_records;
        self.persist(&records)
    }

    fn persist(&self, records: &BTreeMap<String, T>) -> ToolResult<()> {
        let json = serde_json::to_vec_pretty(records)?;
        osp_paths::atomic_write(&self.path, &json)
            .map_err(|e| ToolError::internal(format!("persist {}: {e}", self.path.display())))
    }
}

// ---------------------------------------------------------------------------
// Project registry records
// ---------------------------------------------------------------------------

/// One deployable target inside a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectTarget {
    /// Working directory used for context detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Repository root the safe runner is confined to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<String>,
    /// Policy block consumed by the write gate (schema owned by osp-policy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
}

/// A named project in `projects.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Target used when a call names the project but no target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
    /// Targets by name.
    #[serde(default)]
    pub targets: BTreeMap<String, ProjectTarget>,
    /// Named policy profiles shared across targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_profiles: Option<BTreeMap<String, Value>>,
}

impl Project {
    /// Resolve a target by name, falling back to `default_target`.
    #[must_use]
    pub fn target(&self, name: Option<&str>) -> Option<(String, &ProjectTarget)> {
        let name = name
            .map(str::to_owned)
            .or_else(|| self.default_target.clone())?;
        self.targets.get(&name).map(|t| (name, t))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
