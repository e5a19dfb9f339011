// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recursive spill of oversize values into artifacts.
//!
//! A string longer than the inline budget is replaced by an opaque
//! placeholder carrying size, hash, preview/tail slices, and (for
//! non-sensitive fields) an artifact holding the captured prefix.
//! Sensitive fields get `artifact: null` and the capture is discarded.

use osp_artifact::ArtifactStore;
use osp_error::ToolResult;
use osp_paths::Budgets;
use osp_secure::redact::is_sensitive_key;
use osp_secure::sha256_hex;
use serde_json::{json, Map, Value};

/// Characters kept in the placeholder preview and tail.
const PREVIEW_CHARS: usize = 200;

/// Context threaded through one spill pass (one tool call).
pub struct Spiller<'a> {
    artifacts: &'a ArtifactStore,
    budgets: &'a Budgets,
    trace_id: &'a str,
    span_id: &'a str,
    spills: usize,
}

impl<'a> Spiller<'a> {
    /// New pass with a fresh spill counter.
    pub fn new(
        artifacts: &'a ArtifactStore,
        budgets: &'a Budgets,
        trace_id: &'a str,
        span_id: &'a str,
    ) -> Self {
        Self {
            artifacts,
            budgets,
            trace_id,
            span_id,
            spills: 0,
        }
    }

    /// Walk `value`, replacing oversize strings with placeholders.
    ///
    /// # Errors
    ///
    /// Propagates artifact write failures.
    pub fn spill(&mut self, value: Value) -> ToolResult<Value> {
        self.walk(value, false)
    }

    fn walk(&mut self, value: Value, sensitive: bool) -> ToolResult<Value> {
        match value {
            Value::String(s) => {
                if s.len() <= self.budgets.max_inline_bytes {
                    return Ok(Value::String(s));
                }
                self.placeholder(&s, sensitive)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.walk(item, sensitive)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    // Sensitivity is inherited: anything under a credential
                    // key never reaches an artifact.
                    let child_sensitive = sensitive || is_sensitive_key(&key);
                    let walked = self.walk(val, child_sensitive)?;
                    out.insert(key, walked);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }

    fn placeholder(&mut self, s: &str, sensitive: bool) -> ToolResult<Value> {
        let bytes = s.len();
        let preview: String = s.chars().take(PREVIEW_CHARS).collect();
        let tail: String = {
            let chars: Vec<char> = s.chars().collect();
            chars[chars.len().saturating_sub(PREVIEW_CHARS)..]
                .iter()
                .collect()
        };

        let artifact = if sensitive || self.spills >= self.budgets.max_spills {
            None
        } else {
            let capture_len = floor_char_boundary(s, self.budgets.max_capture_bytes);
            let capture = &s.as_bytes()[..capture_len];
            let written = self.artifacts.write(
                self.trace_id,
                self.span_id,
                &format!("spill-{}.txt", self.spills),
                capture,
            )?;
            written.map(|mut art| {
                art.truncated = bytes > capture_len;
                self.spills += 1;
                art
            })
        };

        Ok(json!({
            "truncated": true,
            "bytes": bytes,
            "sha256": sha256_hex(s.as_bytes()),
            "preview": preview,
            "tail": tail,
            "artifact": artifact,
        }))
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, ArtifactStore, Budgets) {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::rooted_at(tmp.path());
        let budgets = Budgets {
            max_inline_bytes: 16,
            max_capture_bytes: 64,
            max_spills: 2,
            tool_call_timeout_ms: 55_000,
        };
        (tmp, artifacts, budgets)
    }

    #[test]
    fn small_values_pass_untouched() {
        let (_tmp, artifacts, budgets) = fixture();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let input = json!({"short": "ok", "n": 4, "list": ["a", "b"]});
        assert_eq!(spiller.spill(input.clone()).unwrap(), input);
    }

    #[test]
    fn boundary_is_exclusive() {
        let (_tmp, artifacts, budgets) = fixture();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let exact = "x".repeat(16);
        assert_eq!(
            spiller.spill(json!({"v": exact.clone()})).unwrap(),
            json!({"v": exact})
        );
        let over = "x".repeat(17);
        let out = spiller.spill(json!({"v": over})).unwrap();
        assert_eq!(out["v"]["truncated"], true);
        assert_eq!(out["v"]["bytes"], 17);
    }

    #[test]
    fn placeholder_carries_hash_preview_and_artifact() {
        let (_tmp, artifacts, budgets) = fixture();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let big = "0123456789".repeat(20); // 200 bytes
        let out = spiller.spill(json!({"log": big.clone()})).unwrap();
        let ph = &out["log"];
        assert_eq!(ph["bytes"], 200);
        assert_eq!(ph["sha256"], sha256_hex(big.as_bytes()));
        assert!(ph["preview"].as_str().unwrap().starts_with("0123456789"));
        let artifact = ph["artifact"].as_object().expect("artifact present");
        // Capture clamps at max_capture_bytes and flags the truncation.
        assert_eq!(artifact["bytes"], 64);
        assert_eq!(artifact["truncated"], true);
        let rel = artifact["rel"].as_str().unwrap();
        assert!(rel.starts_with("runs/t/tool_calls/s/spill-0"));
    }

    #[test]
    fn sensitive_fields_never_spill_to_artifacts() {
        let (_tmp, artifacts, budgets) = fixture();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let secret = "s".repeat(100);
        let out = spiller
            .spill(json!({"auth_token": secret, "nested": {"password": {"inner": "x".repeat(50)}}}))
            .unwrap();
        assert_eq!(out["auth_token"]["artifact"], Value::Null);
        // Sensitivity is inherited by descendants.
        assert_eq!(out["nested"]["password"]["inner"]["artifact"], Value::Null);
        assert!(artifacts.list("", None).unwrap().is_empty());
    }

    #[test]
    fn spill_cap_bounds_artifact_count() {
        let (_tmp, artifacts, budgets) = fixture();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let big = "y".repeat(40);
        let out = spiller
            .spill(json!({"a": big.clone(), "b": big.clone(), "c": big}))
            .unwrap();
        let with_artifacts = ["a", "b", "c"]
            .iter()
            .filter(|k| !out[**k]["artifact"].is_null())
            .count();
        assert_eq!(with_artifacts, 2);
        assert_eq!(artifacts.list("", None).unwrap().len(), 2);
    }

    #[test]
    fn unavailable_store_still_produces_placeholders() {
        let budgets = Budgets {
            max_inline_bytes: 8,
            max_capture_bytes: 64,
            max_spills: 2,
            tool_call_timeout_ms: 55_000,
        };
        let artifacts = ArtifactStore::unavailable();
        let mut spiller = Spiller::new(&artifacts, &budgets, "t", "s");
        let out = spiller.spill(json!({"v": "z".repeat(20)})).unwrap();
        assert_eq!(out["v"]["truncated"], true);
        assert_eq!(out["v"]["artifact"], Value::Null);
    }
}
