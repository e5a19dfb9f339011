// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-secure
#![deny(unsafe_code)]
//!
//! Secrets are sealed with AES-256-GCM under a single process key. The
//! on-disk form is `iv_hex:tag_hex:ciphertext_hex`; plaintext never touches
//! disk. Key precedence: `ENCRYPTION_KEY` env, persisted key file, freshly
//! generated key persisted with mode 0600.

pub mod redact;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use osp_error::{ErrorCode, ToolError, ToolResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Symmetric key size (AES-256).
pub const KEY_BYTES: usize = 32;
/// AES-GCM nonce size.
pub const IV_BYTES: usize = 12;
/// AES-GCM authentication tag size.
pub const TAG_BYTES: usize = 16;

/// Environment variable carrying an externally-managed process key.
pub const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// SecretKey
// ---------------------------------------------------------------------------

/// The process-wide symmetric key. Debug output never shows key material.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_BYTES]);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([redacted])")
    }
}

impl SecretKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Load the process key.
    ///
    /// Precedence: `ENCRYPTION_KEY` env (decoded by shape: 64 hex chars,
    /// else base64 of 32 bytes, else raw UTF-8 bytes zero-padded/truncated),
    /// then the key file at `key_path` (hex text), else a freshly generated
    /// random key persisted to `key_path` with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns `DECRYPT_FAILED` when an existing key file is unreadable or
    /// malformed, or an internal error when a fresh key cannot be persisted.
    pub fn load(key_path: &Path) -> ToolResult<Self> {
        if let Ok(raw) = std::env::var(ENV_ENCRYPTION_KEY) {
            if !raw.trim().is_empty() {
                return Ok(Self(decode_env_key(raw.trim())));
            }
        }

        if key_path.exists() {
            let text = std::fs::read_to_string(key_path).map_err(|e| {
                ToolError::new(
                    ErrorCode::DecryptFailed,
                    format!("read key file {}: {e}", key_path.display()),
                )
            })?;
            let bytes = hex::decode(text.trim()).map_err(|_| {
                ToolError::new(ErrorCode::DecryptFailed, "key file is not valid hex")
            })?;
            let arr: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| {
                ToolError::new(ErrorCode::DecryptFailed, "key file has wrong length")
            })?;
            return Ok(Self(arr));
        }

        let mut fresh = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut fresh);
        osp_paths::atomic_write(key_path, hex::encode(fresh).as_bytes())
            .map_err(|e| ToolError::internal(format!("persist key file: {e}")))?;
        Ok(Self(fresh))
    }

    /// Seal a plaintext string into the `iv:tag:ciphertext` hex form.
    ///
    /// A fresh random IV is drawn per call, so sealing the same plaintext
    /// twice yields different blobs.
    ///
    /// # Errors
    ///
    /// Returns an internal error if encryption fails.
    pub fn seal(&self, plaintext: &str) -> ToolResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| ToolError::internal("bad key length for AES-256-GCM"))?;
        let mut iv = [0u8; IV_BYTES];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        // aes-gcm appends the 16-byte tag to the ciphertext.
        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ToolError::internal("encryption failed"))?;
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_BYTES);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ct)
        ))
    }

    /// Open a sealed blob produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns `DECRYPT_FAILED` on malformed shape, wrong IV/tag length,
    /// authentication failure, or non-UTF-8 plaintext.
    pub fn open(&self, blob: &str) -> ToolResult<String> {
        let parts: Vec<&str> = blob.split(':').collect();
        let [iv_hex, tag_hex, ct_hex] = parts.as_slice() else {
            return Err(bad_blob("expected iv:tag:ciphertext"));
        };
        let iv = hex::decode(iv_hex).map_err(|_| bad_blob("iv is not hex"))?;
        let tag = hex::decode(tag_hex).map_err(|_| bad_blob("tag is not hex"))?;
        let ct = hex::decode(ct_hex).map_err(|_| bad_blob("ciphertext is not hex"))?;
        if iv.len() != IV_BYTES {
            return Err(bad_blob("wrong iv length"));
        }
        if tag.len() != TAG_BYTES {
            return Err(bad_blob("wrong tag length"));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| ToolError::internal("bad key length for AES-256-GCM"))?;
        let nonce = Nonce::from_slice(&iv);
        let mut sealed = ct;
        sealed.extend_from_slice(&tag);
        let plain = cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| ToolError::new(ErrorCode::DecryptFailed, "authentication failed"))?;
        String::from_utf8(plain)
            .map_err(|_| ToolError::new(ErrorCode::DecryptFailed, "plaintext is not UTF-8"))
    }
}

fn bad_blob(reason: &str) -> ToolError {
    ToolError::new(ErrorCode::DecryptFailed, format!("malformed blob: {reason}"))
}

fn decode_env_key(raw: &str) -> [u8; KEY_BYTES] {
    if raw.len() == KEY_BYTES * 2 {
        if let Ok(bytes) = hex::decode(raw) {
            if let Ok(arr) = <[u8; KEY_BYTES]>::try_from(bytes) {
                return arr;
            }
        }
    }
    if let Ok(bytes) = BASE64.decode(raw) {
        if let Ok(arr) = <[u8; KEY_BYTES]>::try_from(bytes) {
            return arr;
        }
    }
    // Raw UTF-8: zero-pad or truncate to the key size.
    let mut arr = [0u8; KEY_BYTES];
    let src = raw.as_bytes();
    let n = src.len().min(KEY_BYTES);
    arr[..n].copy_from_slice(&src[..n]);
    arr
}

// ---------------------------------------------------------------------------
// Secret references
// ---------------------------------------------------------------------------

/// A late-bound secret reference stored in place of a literal value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    /// `ref:env:<NAME>` — resolved from the process environment at read time.
    Env(String),
    /// `ref:vault:<path>` — delegated to the vault collaborator at read time.
    Vault(String),
}

impl SecretRef {
    /// Parse a secret value into a reference, if it is one.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if let Some(name) = value.strip_prefix("ref:env:") {
            return Some(Self::Env(name.to_string()));
        }
        if let Some(path) = value.strip_prefix("ref:vault:") {
            return Some(Self::Vault(path.to_string()));
        }
        None
    }
}

/// Resolver seam for `ref:vault:` secrets; the vault client lives outside
/// the core and plugs in here.
pub trait VaultResolver: Send + Sync {
    /// Fetch the secret at `path`, scoped to an optional vault profile name.
    fn resolve(&self, path: &str, vault_profile: Option<&str>) -> ToolResult<String>;
}

/// Default resolver used when no vault collaborator is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVault;

impl VaultResolver for NoVault {
    fn resolve(&self, path: &str, _vault_profile: Option<&str>) -> ToolResult<String> {
        Err(ToolError::new(
            ErrorCode::ExternalToolUnavailable,
            format!("no vault client available to resolve '{path}'"),
        ))
    }
}

/// Resolve a stored secret value: literal strings pass through, `ref:env:`
/// reads the environment, `ref:vault:` goes through `vault`.
///
/// # Errors
///
/// Returns `MISSING_INPUTS` when a referenced env var is unset, or the
/// vault resolver's error.
pub fn resolve_secret(
    value: &str,
    vault: &dyn VaultResolver,
    vault_profile: Option<&str>,
) -> ToolResult<String> {
    match SecretRef::parse(value) {
        None => Ok(value.to_string()),
        Some(SecretRef::Env(name)) => std::env::var(&name).map_err(|_| {
            ToolError::new(
                ErrorCode::MissingInputs,
                format!("env var '{name}' referenced by secret is unset"),
            )
        }),
        Some(SecretRef::Vault(path)) => vault.resolve(&path, vault_profile),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
