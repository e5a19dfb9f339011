// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boolean predicates over a JSON context.
//!
//! Used by step `when` guards (against the run context) and `retry.until`
//! conditions (against `{result, meta}` of the last attempt).

use osp_template::lookup_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A comparison anchored at a context path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathTest {
    /// Dotted lookup path.
    pub path: String,
    /// Comparison operand (unused by `exists`).
    #[serde(default)]
    pub value: Value,
}

/// Boolean AST evaluated against a JSON context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuePredicate {
    /// Path resolves to a non-null value.
    Exists {
        /// Dotted lookup path.
        path: String,
    },
    /// Resolved value equals the operand.
    Equals(PathTest),
    /// Resolved value differs from the operand.
    NotEquals(PathTest),
    /// Resolved value is one of the operands.
    In {
        /// Dotted lookup path.
        path: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Array contains the operand, string contains the substring, or object
    /// has the key.
    Contains(PathTest),
    /// Numeric greater-than.
    Gt(PathTest),
    /// Numeric greater-or-equal.
    Gte(PathTest),
    /// Numeric less-than.
    Lt(PathTest),
    /// Numeric less-or-equal.
    Lte(PathTest),
    /// All sub-predicates hold.
    And(Vec<ValuePredicate>),
    /// At least one sub-predicate holds.
    Or(Vec<ValuePredicate>),
    /// The sub-predicate does not hold.
    Not(Box<ValuePredicate>),
}

impl ValuePredicate {
    /// Evaluate against `ctx`. Missing paths make comparisons false (and
    /// `exists` false); they never error.
    #[must_use]
    pub fn matches(&self, ctx: &Value) -> bool {
        match self {
            Self::Exists { path } => lookup_path(ctx, path).is_some_and(|v| !v.is_null()),
            Self::Equals(t) => lookup_path(ctx, &t.path).is_some_and(|v| v == t.value),
            Self::NotEquals(t) => lookup_path(ctx, &t.path).is_none_or(|v| v != t.value),
            Self::In { path, values } => {
                lookup_path(ctx, path).is_some_and(|v| values.contains(&v))
            }
            Self::Contains(t) => lookup_path(ctx, &t.path).is_some_and(|v| contains(&v, &t.value)),
            Self::Gt(t) => compare(ctx, t).is_some_and(|ord| ord == std::cmp::Ordering::Greater),
            Self::Gte(t) => compare(ctx, t).is_some_and(|ord| ord != std::cmp::Ordering::Less),
            Self::Lt(t) => compare(ctx, t).is_some_and(|ord| ord == std::cmp::Ordering::Less),
            Self::Lte(t) => compare(ctx, t).is_some_and(|ord| ord != std::cmp::Ordering::Greater),
            Self::And(preds) => preds.iter().all(|p| p.matches(ctx)),
            Self::Or(preds) => preds.iter().any(|p| p.matches(ctx)),
            Self::Not(pred) => !pred.matches(ctx),
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.contains(needle),
        Value::String(s) => needle.as_str().is_some_and(|sub| s.contains(sub)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(ctx: &Value, test: &PathTest) -> Option<std::cmp::Ordering> {
    let left = lookup_path(ctx, &test.path)?.as_f64()?;
    let right = test.value.as_f64()?;
    left.partial_cmp(&right)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "input": {"env": "prod", "replicas": 3},
            "steps": {"check": {"result": {"ok": true, "items": ["a", "b"], "note": "all green"}}},
        })
    }

    fn parse(v: Value) -> ValuePredicate {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn exists() {
        assert!(parse(json!({"exists": {"path": "input.env"}})).matches(&ctx()));
        assert!(!parse(json!({"exists": {"path": "input.missing"}})).matches(&ctx()));
    }

    #[test]
    fn equality() {
        assert!(parse(json!({"equals": {"path": "input.env", "value": "prod"}})).matches(&ctx()));
        assert!(
            !parse(json!({"equals": {"path": "input.env", "value": "dev"}})).matches(&ctx())
        );
        assert!(
            parse(json!({"not_equals": {"path": "input.env", "value": "dev"}})).matches(&ctx())
        );
        // Missing path: equals false, not_equals true.
        assert!(!parse(json!({"equals": {"path": "gone", "value": 1}})).matches(&ctx()));
        assert!(parse(json!({"not_equals": {"path": "gone", "value": 1}})).matches(&ctx()));
    }

    #[test]
    fn membership_and_contains() {
        assert!(
            parse(json!({"in": {"path": "input.env", "values": ["dev", "prod"]}})).matches(&ctx())
        );
        assert!(parse(json!({"contains": {"path": "steps.check.result.items", "value": "a"}}))
            .matches(&ctx()));
        assert!(parse(json!({"contains": {"path": "steps.check.result.note", "value": "green"}}))
            .matches(&ctx()));
        assert!(parse(json!({"contains": {"path": "steps.check.result", "value": "ok"}}))
            .matches(&ctx()));
        assert!(!parse(json!({"contains": {"path": "input.replicas", "value": 3}}))
            .matches(&ctx()));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(parse(json!({"gt": {"path": "input.replicas", "value": 2}})).matches(&ctx()));
        assert!(parse(json!({"gte": {"path": "input.replicas", "value": 3}})).matches(&ctx()));
        assert!(parse(json!({"lt": {"path": "input.replicas", "value": 4}})).matches(&ctx()));
        assert!(parse(json!({"lte": {"path": "input.replicas", "value": 3}})).matches(&ctx()));
        assert!(!parse(json!({"gt": {"path": "input.replicas", "value": 3}})).matches(&ctx()));
        // Non-numeric operands never match.
        assert!(!parse(json!({"gt": {"path": "input.env", "value": 1}})).matches(&ctx()));
    }

    #[test]
    fn boolean_combinators() {
        let pred = parse(json!({
            "and": [
                {"equals": {"path": "input.env", "value": "prod"}},
                {"not": {"equals": {"path": "steps.check.result.ok", "value": false}}},
            ]
        }));
        assert!(pred.matches(&ctx()));

        let pred = parse(json!({
            "or": [
                {"equals": {"path": "input.env", "value": "dev"}},
                {"gte": {"path": "input.replicas", "value": 10}},
            ]
        }));
        assert!(!pred.matches(&ctx()));
    }
}
