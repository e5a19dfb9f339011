// SPDX-License-Identifier: MIT OR Apache-2.0
//! Named typed profiles with sealed secrets.
//!
//! Secrets are sealed before they reach the in-memory map, so neither the
//! map nor `profiles.json` ever holds plaintext. Decryption happens into
//! call-local values returned by [`ProfileStore::get`].

use chrono::{DateTime, Utc};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_secure::{resolve_secret, SecretKey, VaultResolver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A stored profile. `secrets` values are always in the sealed
/// `iv:tag:ciphertext` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile type, e.g. `ssh`, `postgres`, `http`, `vault`, `env`.
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Non-secret configuration.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Sealed secrets.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// How a `set` call treats the existing secrets map.
#[derive(Debug, Clone, Default)]
pub enum SecretsUpdate {
    /// Leave existing secrets untouched.
    #[default]
    Keep,
    /// Drop all secrets.
    Clear,
    /// Merge: each entry seals a new value, `None` deletes that one secret.
    Merge(BTreeMap<String, Option<String>>),
}

/// Mutation applied by [`ProfileStore::set`].
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    /// Profile type; required when creating, checked when updating.
    pub profile_type: Option<String>,
    /// Data merge; `Value::Null` entries delete the key.
    pub data: Option<BTreeMap<String, Value>>,
    /// Secrets treatment.
    pub secrets: SecretsUpdate,
}

/// Decrypted, call-local view of a profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    /// Profile name.
    pub name: String,
    /// Profile type.
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Non-secret configuration.
    pub data: BTreeMap<String, Value>,
    /// Decrypted secrets; dropped with this value when the call returns.
    pub secrets: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Listing entry; never includes secret values.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    /// Profile name.
    pub name: String,
    /// Profile type.
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Non-secret configuration.
    pub data: BTreeMap<String, Value>,
    /// Names of the sealed secret fields.
    pub secret_fields: Vec<String>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// File-backed profile store.
pub struct ProfileStore {
    path: PathBuf,
    key: SecretKey,
    vault: Arc<dyn VaultResolver>,
    profiles: Mutex<BTreeMap<String, Profile>>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore").field("path", &self.path).finish()
    }
}

impl ProfileStore {
    /// Open the store, loading `profiles.json` if present.
    ///
    /// # Errors
    ///
    /// Returns an internal error if an existing file cannot be parsed.
    pub fn open(
        path: impl Into<PathBuf>,
        key: SecretKey,
        vault: Arc<dyn VaultResolver>,
    ) -> ToolResult<Self> {
        let path = path.into();
        let profiles = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| ToolError::internal(format!("parse {}: {e}", path.display())))?,
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            key,
            vault,
            profiles: Mutex::new(profiles),
        })
    }

    /// Create or update a profile.
    ///
    /// # Errors
    ///
    /// `MISSING_INPUTS` when creating without a type,
    /// `PROFILE_TYPE_MISMATCH` when updating with a different type, and
    /// internal errors on seal or persist failure.
    pub fn set(&self, name: &str, update: ProfileUpdate) -> ToolResult<ProfileSummary> {
        let mut profiles = self.profiles.lock().expect("profile lock poisoned");
        let now = Utc::now();

        let mut profile = match profiles.get(name) {
            Some(existing) => {
                if let Some(requested) = &update.profile_type {
                    if requested != &existing.profile_type {
                        return Err(type_mismatch(name, &existing.profile_type, requested));
                    }
                }
                existing.clone()
            }
            None => {
                let profile_type = update.profile_type.clone().ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::MissingInputs,
                        format!("profile '{name}' does not exist; 'type' is required to create it"),
                    )
                })?;
                Profile {
                    profile_type,
                    data: BTreeMap::new(),
                    secrets: BTreeMap::new(),
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        if let Some(data) = &update.data {
            for (field, value) in data {
                if value.is_null() {
                    profile.data.remove(field);
                } else {
                    profile.data.insert(field.clone(), value.clone());
                }
            }
        }

        match &update.secrets {
            SecretsUpdate::Keep => {}
            SecretsUpdate::Clear => profile.secrets.clear(),
            SecretsUpdate::Merge(entries) => {
                for (field, value) in entries {
                    match value {
                        None => {
                            profile.secrets.remove(field);
                        }
                        Some(plaintext) => {
                            let sealed = self.key.seal(plaintext)?;
                            profile.secrets.insert(field.clone(), sealed);
                        }
                    }
                }
            }
        }

        profile.updated_at = now;
        let summary = summarize(name, &profile);
        profiles.insert(name.to_string(), profile);
        self.persist(&profiles)?;
        Ok(summary)
    }

    /// Fetch a profile with decrypted secrets.
    ///
    /// Secret values that are `ref:env:` / `ref:vault:` references are
    /// resolved at this point and never persisted in resolved form.
    ///
    /// # Errors
    ///
    /// `PROFILE_NOT_FOUND`, `PROFILE_TYPE_MISMATCH`, `DECRYPT_FAILED`, or
    /// the secret-reference resolver's error.
    pub fn get(&self, name: &str, expected_type: Option<&str>) -> ToolResult<ProfileView> {
        let profile = {
            let profiles = self.profiles.lock().expect("profile lock poisoned");
            profiles.get(name).cloned().ok_or_else(|| not_found(name))?
        };
        if let Some(expected) = expected_type {
            if expected != profile.profile_type {
                return Err(type_mismatch(name, &profile.profile_type, expected));
            }
        }

        let vault_profile = profile
            .data
            .get("vault_profile")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let mut secrets = BTreeMap::new();
        for (field, sealed) in &profile.secrets {
            let opened = self.key.open(sealed)?;
            let resolved = resolve_secret(&opened, self.vault.as_ref(), vault_profile.as_deref())?;
            secrets.insert(field.clone(), resolved);
        }

        Ok(ProfileView {
            name: name.to_string(),
            profile_type: profile.profile_type,
            data: profile.data,
            secrets,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
        })
    }

    /// List profiles, optionally filtered by type. Never returns secrets.
    #[must_use]
    pub fn list(&self, profile_type: Option<&str>) -> Vec<ProfileSummary> {
        let profiles = self.profiles.lock().expect("profile lock poisoned");
        profiles
            .iter()
            .filter(|(_, p)| profile_type.is_none_or(|t| t == p.profile_type))
            .map(|(name, p)| summarize(name, p))
            .collect()
    }

    /// Delete a profile.
    ///
    /// # Errors
    ///
    /// `PROFILE_NOT_FOUND` when the profile does not exist; internal errors
    /// on persist failure.
    pub fn delete(&self, name: &str) -> ToolResult<()> {
        let mut profiles = self.profiles.lock().expect("profile lock poisoned");
        if profiles.remove(name).is_none() {
            return Err(not_found(name));
        }
        self.persist(&profiles)
    }

    fn persist(&self, profiles: &BTreeMap<String, Profile>) -> ToolResult<()> {
        let json = serde_json::to_vec_pretty(profiles)?;
        osp_paths::atomic_write(&self.path, &json)
            .map_err(|e| ToolError::internal(format!("persist profiles: {e}")))
    }
}

fn summarize(name: &str, profile: &Profile) -> ProfileSummary {
    ProfileSummary {
        name: name.to_string(),
        profile_type: profile.profile_type.clone(),
        data: profile.data.clone(),
        secret_fields: profile.secrets.keys().cloned().collect(),
        updated_at: profile.updated_at,
    }
}

fn not_found(name: &str) -> ToolError {
    ToolError::new(
        ErrorCode::ProfileNotFound,
        format!("profile '{name}' not found"),
    )
}

fn type_mismatch(name: &str, actual: &str, requested: &str) -> ToolError {
    ToolError::new(
        ErrorCode::ProfileTypeMismatch,
        format!("profile '{name}' has type '{actual}', not '{requested}'"),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use osp_secure::NoVault;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let tmp = tempfile::tempdir().unwrap();
        let key = SecretKey::from_bytes([3u8; osp_secure::KEY_BYTES]);
        let store =
            ProfileStore::open(tmp.path().join("profiles.json"), key, Arc::new(NoVault)).unwrap();
        (tmp, store)
    }

    fn update(
        profile_type: &str,
        data: &[(&str, Value)],
        secrets: &[(&str, &str)],
    ) -> ProfileUpdate {
        ProfileUpdate {
            profile_type: Some(profile_type.into()),
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            ),
            secrets: SecretsUpdate::Merge(
                secrets
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), Some((*v).to_string())))
                    .collect(),
            ),
        }
    }

    #[test]
    fn set_get_roundtrip_with_secrets() {
        let (_tmp, store) = store();
        store
            .set(
                "db",
                update(
                    "postgres",
                    &[("host", json!("db.internal")), ("port", json!(5432))],
                    &[("password", "hunter2")],
                ),
            )
            .unwrap();
        let view = store.get("db", Some("postgres")).unwrap();
        assert_eq!(view.data["host"], json!("db.internal"));
        assert_eq!(view.secrets["password"], "hunter2");
    }

    #[test]
    fn plaintext_never_reaches_disk() {
        let (tmp, store) = store();
        store
            .set("db", update("postgres", &[], &[("password", "sup3r-s3cret")]))
            .unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("profiles.json")).unwrap();
        assert!(!raw.contains("sup3r-s3cret"));
        assert!(raw.contains("password"));
    }

    #[test]
    fn null_data_value_deletes_key() {
        let (_tmp, store) = store();
        store
            .set("p", update("http", &[("url", json!("https://a")), ("timeout", json!(5))], &[]))
            .unwrap();
        store.set("p", update("http", &[("timeout", Value::Null)], &[])).unwrap();
        let view = store.get("p", None).unwrap();
        assert!(view.data.contains_key("url"));
        assert!(!view.data.contains_key("timeout"));
    }

    #[test]
    fn secret_merge_and_single_delete() {
        let (_tmp, store) = store();
        store
            .set("p", update("ssh", &[], &[("key", "k1"), ("passphrase", "p1")]))
            .unwrap();
        let mut merge = BTreeMap::new();
        merge.insert("passphrase".to_string(), None);
        store
            .set(
                "p",
                ProfileUpdate {
                    profile_type: None,
                    data: None,
                    secrets: SecretsUpdate::Merge(merge),
                },
            )
            .unwrap();
        let view = store.get("p", None).unwrap();
        assert_eq!(view.secrets.len(), 1);
        assert_eq!(view.secrets["key"], "k1");
    }

    #[test]
    fn clear_drops_all_secrets() {
        let (_tmp, store) = store();
        store.set("p", update("ssh", &[], &[("key", "k1")])).unwrap();
        store
            .set(
                "p",
                ProfileUpdate {
                    secrets: SecretsUpdate::Clear,
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        assert!(store.get("p", None).unwrap().secrets.is_empty());
    }

    #[test]
    fn type_mismatch_is_conflict() {
        let (_tmp, store) = store();
        store.set("p", update("ssh", &[], &[])).unwrap();
        let err = store.get("p", Some("postgres")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProfileTypeMismatch);
        let err = store.set("p", update("postgres", &[], &[])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProfileTypeMismatch);
    }

    #[test]
    fn create_without_type_is_rejected() {
        let (_tmp, store) = store();
        let err = store.set("p", ProfileUpdate::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingInputs);
    }

    #[test]
    fn list_never_exposes_secret_values() {
        let (_tmp, store) = store();
        store.set("a", update("ssh", &[], &[("key", "secret-material")])).unwrap();
        store.set("b", update("http", &[], &[])).unwrap();
        let all = store.list(None);
        assert_eq!(all.len(), 2);
        let json = serde_json::to_string(&all).unwrap();
        assert!(!json.contains("secret-material"));
        assert_eq!(store.list(Some("ssh")).len(), 1);
    }

    #[test]
    fn delete_unknown_profile_fails() {
        let (_tmp, store) = store();
        let err = store.delete("ghost").unwrap_err();
        assert_eq!(err.code, ErrorCode::ProfileNotFound);
    }

    #[test]
    fn reopen_preserves_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        let key = SecretKey::from_bytes([3u8; osp_secure::KEY_BYTES]);
        let path = tmp.path().join("profiles.json");
        {
            let store = ProfileStore::open(&path, key.clone(), Arc::new(NoVault)).unwrap();
            store.set("db", update("postgres", &[], &[("password", "pw")])).unwrap();
        }
        let store = ProfileStore::open(&path, key, Arc::new(NoVault)).unwrap();
        assert_eq!(store.get("db", None).unwrap().secrets["password"], "pw");
    }

    #[test]
    fn env_secret_ref_resolves_on_get() {
        let (_tmp, store) = store();
        store
            .set("db", update("postgres", &[], &[("password", "ref:env:OSP_PROFILE_TEST_PW")]))
            .unwrap();
        temp_env::with_var("OSP_PROFILE_TEST_PW", Some("resolved"), || {
            let view = store.get("db", None).unwrap();
            assert_eq!(view.secrets["password"], "resolved");
        });
    }
}
