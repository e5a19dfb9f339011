// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-template
#![deny(unsafe_code)]

use osp_error::{ErrorCode, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a missing (non-optional) placeholder path produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// Missing paths are an error (default).
    #[default]
    Error,
    /// Missing paths become the empty string.
    Empty,
    /// Missing paths become JSON `null`.
    Null,
    /// Missing paths drop the surrounding object key (`null` in arrays).
    Undefined,
}

/// One parsed segment of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { path: String, optional: bool },
}

/// Template expander parameterised by a missing-path policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEngine {
    /// Policy applied to missing non-optional paths.
    pub missing: MissingPolicy,
}

impl TemplateEngine {
    /// Engine with the given missing policy.
    #[must_use]
    pub fn new(missing: MissingPolicy) -> Self {
        Self { missing }
    }

    /// Recursively expand every string in `args` against `ctx`.
    ///
    /// Object keys whose value resolves to *undefined* are dropped; in
    /// arrays the slot becomes `null` to keep indices stable.
    ///
    /// # Errors
    ///
    /// `TEMPLATE_MISSING_PATH` for missing non-optional paths under the
    /// `Error` policy; `RUNBOOK_INVALID` for unterminated placeholders.
    pub fn expand(&self, args: &Value, ctx: &Value) -> ToolResult<Value> {
        match args {
            Value::String(s) => Ok(self.expand_str(s, ctx)?.unwrap_or(Value::Null)),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.expand(item, ctx)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    match val {
                        Value::String(s) => {
                            if let Some(expanded) = self.expand_str(s, ctx)? {
                                out.insert(key.clone(), expanded);
                            }
                        }
                        other => {
                            out.insert(key.clone(), self.expand(other, ctx)?);
                        }
                    }
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Expand one string. `Ok(None)` means the value is *undefined* and the
    /// caller should drop it.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`expand`](Self::expand).
    pub fn expand_str(&self, input: &str, ctx: &Value) -> ToolResult<Option<Value>> {
        let segments = parse(input)?;

        // Exact-match placeholder: preserve the resolved value's type.
        if let [Segment::Placeholder { path, optional }] = segments.as_slice() {
            return match lookup_path(ctx, path) {
                Some(value) => Ok(Some(value)),
                None => self.missing_value(path, *optional),
            };
        }

        let mut out = String::new();
        for segment in &segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { path, optional } => {
                    let resolved = match lookup_path(ctx, path) {
                        Some(value) => Some(value),
                        None => self.missing_value(path, *optional)?,
                    };
                    if let Some(value) = resolved {
                        out.push_str(&stringify(&value));
                    }
                }
            }
        }
        Ok(Some(Value::String(out)))
    }

    fn missing_value(&self, path: &str, optional: bool) -> ToolResult<Option<Value>> {
        if optional {
            return Ok(None);
        }
        match self.missing {
            MissingPolicy::Error => Err(ToolError::new(
                ErrorCode::TemplateMissingPath,
                format!("template path '{path}' did not resolve"),
            )),
            MissingPolicy::Empty => Ok(Some(Value::String(String::new()))),
            MissingPolicy::Null => Ok(Some(Value::Null)),
            MissingPolicy::Undefined => Ok(None),
        }
    }
}

/// Look up a dotted path (with numeric array indices) in a JSON value.
#[must_use]
pub fn lookup_path(ctx: &Value, path: &str) -> Option<Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => serde_json::to_string(composite).unwrap_or_default(),
    }
}

fn parse(input: &str) -> ToolResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            ToolError::new(
                ErrorCode::RunbookInvalid,
                format!("unterminated template placeholder in '{input}'"),
            )
        })?;
        let raw = after_open[..close].trim();
        let (path, optional) = match raw.strip_prefix('?') {
            Some(stripped) => (stripped.trim(), true),
            None => (raw, false),
        };
        if path.is_empty() {
            return Err(ToolError::new(
                ErrorCode::RunbookInvalid,
                format!("empty template placeholder in '{input}'"),
            ));
        }
        segments.push(Segment::Placeholder {
            path: path.to_string(),
            optional,
        });
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    if segments.is_empty() {
        segments.push(Segment::Literal(String::new()));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
