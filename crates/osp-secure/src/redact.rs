// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential redaction for audit entries and outbound errors.
//!
//! Redaction is deterministic: the same input always produces the same
//! output. Anything keyed by a credential-looking name is masked; maps named
//! `env` or `variables` are masked wholesale; binary carriers are replaced
//! by length placeholders; long strings are clamped to 500 chars.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Marker substituted for sensitive values.
pub const REDACTED: &str = "[REDACTED]";

/// Maximum characters a redacted string may keep.
pub const MAX_STRING_CHARS: usize = 500;

/// Maps whose values are masked wholesale regardless of key names.
const WHOLESALE_KEYS: &[&str] = &["env", "variables"];

/// Keys that match the credential pattern but are known-benign.
const ALLOWED_KEYS: &[&str] = &[
    "pass_through",
    "author",
    "authors",
    "key_prefix",
    "keyspace",
    "ref",
    "refs",
    "git_ref",
    "plan_ref",
];

fn sensitive_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(key|token|secret|pass|pwd|auth|authorization)").expect("valid pattern")
    })
}

fn credential_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9+/=._~-]+").expect("valid pattern")
    })
}

/// Returns `true` when a field name should have its value masked.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    if ALLOWED_KEYS.contains(&lowered.as_str()) {
        return false;
    }
    sensitive_key_re().is_match(&lowered)
}

/// Redact a free-text string: mask inline credentials and clamp length.
#[must_use]
pub fn redact_text(text: &str) -> String {
    let masked = credential_text_re().replace_all(text, "$1 [REDACTED]");
    clamp_chars(&masked)
}

fn clamp_chars(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_CHARS {
        return s.to_string();
    }
    let kept: String = s.chars().take(MAX_STRING_CHARS - 3).collect();
    format!("{kept}...")
}

/// Placeholder for a binary carrier field, e.g. `[base64:1024]`.
fn binary_placeholder(label: &str, value: &Value) -> Value {
    let n = match value {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    Value::String(format!("[{label}:{n}]"))
}

/// Classify binary carrier keys onto their placeholder label.
fn binary_label(key: &str) -> Option<&'static str> {
    let lowered = key.to_ascii_lowercase();
    if lowered == "stdin" || lowered == "stdin_base64" {
        return Some("stdin");
    }
    if lowered == "patch" {
        return Some("patch");
    }
    if lowered == "base64" || lowered.ends_with("_base64") {
        return Some("base64");
    }
    None
}

/// Deep-redact a JSON value for audit logging.
///
/// Every object key matching the credential pattern has its value replaced
/// by `[REDACTED]`; `env` / `variables` maps are masked wholesale; binary
/// carriers become `[base64:N]` / `[stdin:N]` / `[patch:N]`; strings are
/// clamped to 500 chars. Arrays and nested objects are walked recursively
/// to a fixed depth.
#[must_use]
pub fn redact_value(value: &Value) -> Value {
    redact_at_depth(value, 0)
}

const MAX_DEPTH: usize = 64;

fn redact_at_depth(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String("[depth-limit]".into());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), redact_field(key, val, depth));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact_at_depth(v, depth + 1))
                .collect(),
        ),
        Value::String(s) => Value::String(clamp_chars(s)),
        other => other.clone(),
    }
}

fn redact_field(key: &str, value: &Value, depth: usize) -> Value {
    if let Some(label) = binary_label(key) {
        return binary_placeholder(label, value);
    }
    if WHOLESALE_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
        if let Value::Object(map) = value {
            let mut out = Map::with_capacity(map.len());
            for k in map.keys() {
                out.insert(k.clone(), Value::String(REDACTED.into()));
            }
            return Value::Object(out);
        }
    }
    if is_sensitive_key(key) {
        return Value::String(REDACTED.into());
    }
    redact_at_depth(value, depth + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
