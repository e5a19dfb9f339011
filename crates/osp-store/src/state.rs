// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session + persistent key/value store.
//!
//! The session scope lives and dies with the process; the persistent scope
//! is backed by `state.json` and rewritten atomically on every mutation.
//! All mutations go through one internal lock, so writers are strictly
//! ordered per store. The advisory-lock namespace used by the policy gate
//! lives in the persistent scope under `policy.lock.` keys.

use chrono::{DateTime, Duration, Utc};
use osp_error::{ErrorCode, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Which scope a state operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Process-local, dropped on restart.
    Session,
    /// Backed by `state.json`.
    Persistent,
    /// Session overlaid on persistent (reads); both (deletes).
    #[default]
    Any,
}

impl Scope {
    /// Parse a scope name; unknown names are invalid params.
    pub fn parse(raw: &str) -> ToolResult<Self> {
        match raw {
            "session" => Ok(Self::Session),
            "persistent" => Ok(Self::Persistent),
            "any" => Ok(Self::Any),
            other => Err(ToolError::new(
                ErrorCode::StateInvalidScope,
                format!("unknown state scope '{other}'"),
            )),
        }
    }
}

/// Advisory-lock record stored under `policy.lock.<project>.<target>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockState {
    /// Trace id of the current holder.
    pub holder: String,
    /// Expiry instant; a lock past this point is free.
    pub expires_at: DateTime<Utc>,
}

struct Inner {
    session: BTreeMap<String, Value>,
    persistent: BTreeMap<String, Value>,
}

/// The key/value store shared by tools, runbooks, and the policy gate.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Open the store, loading any existing persistent scope from disk.
    ///
    /// # Errors
    ///
    /// Returns an internal error if an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> ToolResult<Self> {
        let path = path.into();
        let persistent = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| ToolError::internal(format!("parse {}: {e}", path.display())))?,
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                session: BTreeMap::new(),
                persistent,
            }),
        })
    }

    /// Read a key. Scope `any` checks session first, then persistent.
    #[must_use]
    pub fn get(&self, key: &str, scope: Scope) -> Option<Value> {
        let inner = self.inner.lock().expect("state lock poisoned");
        match scope {
            Scope::Session => inner.session.get(key).cloned(),
            Scope::Persistent => inner.persistent.get(key).cloned(),
            Scope::Any => inner
                .session
                .get(key)
                .or_else(|| inner.persistent.get(key))
                .cloned(),
        }
    }

    /// Write a key. Scope `any` is rejected for writes.
    ///
    /// # Errors
    ///
    /// `STATE_INVALID_SCOPE` for `any`; internal errors on persist failure.
    pub fn set(&self, key: &str, value: Value, scope: Scope) -> ToolResult<()> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        match scope {
            Scope::Session => {
                inner.session.insert(key.to_string(), value);
                Ok(())
            }
            Scope::Persistent => {
                inner.persistent.insert(key.to_string(), value);
                self.persist(&inner)
            }
            Scope::Any => Err(ToolError::new(
                ErrorCode::StateInvalidScope,
                "writes must target 'session' or 'persistent'",
            )),
        }
    }

    /// Delete a key. Scope `any` removes it from both scopes.
    ///
    /// Returns `true` when at least one scope held the key.
    ///
    /// # Errors
    ///
    /// Internal errors on persist failure.
    pub fn unset(&self, key: &str, scope: Scope) -> ToolResult<bool> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let mut removed = false;
        if matches!(scope, Scope::Session | Scope::Any) {
            removed |= inner.session.remove(key).is_some();
        }
        if matches!(scope, Scope::Persistent | Scope::Any) {
            let from_persistent = inner.persistent.remove(key).is_some();
            if from_persistent {
                self.persist(&inner)?;
            }
            removed |= from_persistent;
        }
        Ok(removed)
    }

    /// List keys visible in a scope (sorted; `any` is the overlay union).
    #[must_use]
    pub fn list(&self, scope: Scope) -> Vec<String> {
        self.dump(scope).into_keys().collect()
    }

    /// Dump a scope as a map. `any` overlays session on top of persistent.
    #[must_use]
    pub fn dump(&self, scope: Scope) -> BTreeMap<String, Value> {
        let inner = self.inner.lock().expect("state lock poisoned");
        match scope {
            Scope::Session => inner.session.clone(),
            Scope::Persistent => inner.persistent.clone(),
            Scope::Any => {
                let mut out = inner.persistent.clone();
                out.extend(inner.session.clone());
                out
            }
        }
    }

    /// Clear a scope (`any` clears both).
    ///
    /// # Errors
    ///
    /// Internal errors on persist failure.
    pub fn clear(&self, scope: Scope) -> ToolResult<()> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if matches!(scope, Scope::Session | Scope::Any) {
            inner.session.clear();
        }
        if matches!(scope, Scope::Persistent | Scope::Any) {
            inner.persistent.clear();
            self.persist(&inner)?;
        }
        Ok(())
    }

    // -- Advisory locks --------------------------------------------------

    /// Try to take the advisory lock stored at `key` for `holder`.
    ///
    /// Acquire is strict read-check-set under the writer lock: a live lock
    /// held by someone else fails with `POLICY_LOCK_HELD`; an expired or
    /// same-holder lock is replaced.
    ///
    /// # Errors
    ///
    /// `POLICY_LOCK_HELD` when another holder owns a live lock; internal
    /// errors on persist failure.
    pub fn acquire_lock(&self, key: &str, holder: &str, ttl_ms: u64) -> ToolResult<LockState> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let now = Utc::now();
        if let Some(existing) = inner
            .persistent
            .get(key)
            .and_then(|v| serde_json::from_value::<LockState>(v.clone()).ok())
        {
            if existing.expires_at > now && existing.holder != holder {
                return Err(ToolError::new(
                    ErrorCode::PolicyLockHeld,
                    format!("lock '{key}' held by trace {}", existing.holder),
                )
                .with_hint("retry after the holder finishes or the TTL expires")
                .with_details(serde_json::json!({
                    "holder": existing.holder,
                    "expires_at": existing.expires_at,
                })));
            }
        }
        let lock = LockState {
            holder: holder.to_string(),
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
        };
        inner
            .persistent
            .insert(key.to_string(), serde_json::to_value(&lock)?);
        self.persist(&inner)?;
        Ok(lock)
    }

    /// Release the advisory lock at `key` if `holder` owns it.
    ///
    /// Releasing a lock you do not hold is a no-op; release is called from
    /// every exit path and must never fail the surrounding operation.
    pub fn release_lock(&self, key: &str, holder: &str) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let owned = inner
            .persistent
            .get(key)
            .and_then(|v| serde_json::from_value::<LockState>(v.clone()).ok())
            .is_some_and(|l| l.holder == holder);
        if owned {
            inner.persistent.remove(key);
            if let Err(err) = self.persist(&inner) {
                tracing::warn!(target: "osp.store", %err, key, "failed to persist lock release");
            }
        }
    }

    fn persist(&self, inner: &Inner) -> ToolResult<()> {
        let json = serde_json::to_vec_pretty(&inner.persistent)?;
        osp_paths::atomic_write(&self.path, &json)
            .map_err(|e| ToolError::internal(format!("persist state: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
