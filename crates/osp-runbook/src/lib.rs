// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-runbook
#![deny(unsafe_code)]

pub mod engine;
pub mod predicate;

pub use engine::{RunbookEngine, RunbookOutcome, StepOutcome};
pub use predicate::ValuePredicate;

use async_trait::async_trait;
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_template::MissingPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Maximum retry attempts a step may configure.
pub const MAX_RETRY_ATTEMPTS: u32 = 50;
/// Maximum single retry delay.
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
/// Cumulative retry delay budget per step.
pub const RETRY_BUDGET_MS: u64 = 600_000;
/// Concurrency ceiling for `foreach.parallel`.
pub const FOREACH_PARALLEL_CAP: usize = 8;

/// Tool names a runbook step may not invoke (no nested runbooks).
const FORBIDDEN_STEP_TOOLS: &[&str] = &["mcp_runbook", "runbook"];

// ---------------------------------------------------------------------------
// Runbook definition
// ---------------------------------------------------------------------------

/// Fan-out specification for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Foreach {
    /// Template or literal resolving to an array.
    pub items: Value,
    /// Run items concurrently (capped at [`FOREACH_PARALLEL_CAP`]).
    #[serde(default)]
    pub parallel: bool,
}

/// Bounded retry-until loop for one step.
///
/// The cumulative delay budget counts configured delays only; step
/// execution time is additive, so the budget is a floor on observed wall
/// time, not a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Attempt ceiling (clamped to [`MAX_RETRY_ATTEMPTS`]).
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// Multiplier applied to the delay after each attempt (min 1.0).
    #[serde(default = "default_backoff")]
    pub backoff_factor: f64,
    /// Cap applied to any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Whether a failed invocation triggers another attempt.
    #[serde(default = "default_true")]
    pub retry_on_error: bool,
    /// Success predicate over `{result, meta}`, evaluated after each attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<ValuePredicate>,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One runbook step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the runbook.
    pub id: String,
    /// Tool to invoke.
    pub tool: String,
    /// Arguments, expanded against the run context.
    #[serde(default)]
    pub args: Value,
    /// Skip the step unless this predicate holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ValuePredicate>,
    /// Fan the step out over resolved items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<Foreach>,
    /// Retry-until loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Keep running later steps when this one fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// A declarative runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordered, non-empty steps.
    pub steps: Vec<Step>,
    /// Policy for missing non-optional template paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_missing: Option<MissingPolicy>,
}

impl Runbook {
    /// Validate the definition: non-empty ordered steps, unique ids,
    /// `foreach`/`retry` mutually exclusive, no nested runbook tools.
    ///
    /// # Errors
    ///
    /// `RUNBOOK_INVALID` or `RUNBOOK_NESTED` with the offending step named.
    pub fn validate(&self) -> ToolResult<()> {
        if self.steps.is_empty() {
            return Err(invalid("runbook has no steps"));
        }
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(invalid("step id must not be empty"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(&format!("duplicate step id '{}'", step.id)));
            }
            if FORBIDDEN_STEP_TOOLS.contains(&step.tool.as_str()) {
                return Err(ToolError::new(
                    ErrorCode::RunbookNested,
                    format!("step '{}' may not invoke the runbook tool", step.id),
                ));
            }
            if step.foreach.is_some() && step.retry.is_some() {
                return Err(invalid(&format!(
                    "step '{}' sets both foreach and retry",
                    step.id
                )));
            }
            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(invalid(&format!(
                        "step '{}' retry.max_attempts must be at least 1",
                        step.id
                    )));
                }
                if retry.backoff_factor < 1.0 {
                    return Err(invalid(&format!(
                        "step '{}' retry.backoff_factor must be >= 1",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ToolError {
    ToolError::new(ErrorCode::RunbookInvalid, reason)
}

// ---------------------------------------------------------------------------
// Invoker seam
// ---------------------------------------------------------------------------

/// Correlation ids threaded through every tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace id shared by the whole agent interaction.
    pub trace_id: String,
    /// Span id of the current call.
    pub span_id: String,
    /// Span id of the enclosing call, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Root trace with fresh ids.
    #[must_use]
    pub fn root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            span_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: None,
        }
    }

    /// Child context: same trace, this span as the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Result of one tool invocation as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// Shaped tool result.
    pub result: Value,
    /// Envelope metadata (tool, action, trace, duration).
    pub meta: Value,
}

/// Seam through which runbook steps call tools. The execution envelope
/// implements this; tests plug in stubs.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with expanded `args` under the given trace.
    async fn invoke(&self, tool: &str, args: Value, trace: &TraceContext)
        -> ToolResult<Invocation>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, tool: &str) -> Step {
        Step {
            id: id.into(),
            tool: tool.into(),
            args: json!({}),
            when: None,
            foreach: None,
            retry: None,
            continue_on_error: false,
        }
    }

    #[test]
    fn empty_runbook_is_invalid() {
        let rb = Runbook {
            name: None,
            steps: vec![],
            template_missing: None,
        };
        assert_eq!(rb.validate().unwrap_err().code, ErrorCode::RunbookInvalid);
    }

    #[test]
    fn duplicate_ids_are_invalid() {
        let rb = Runbook {
            name: None,
            steps: vec![step("a", "mcp_repo"), step("a", "mcp_state")],
            template_missing: None,
        };
        let err = rb.validate().unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn nested_runbook_tool_is_refused() {
        let rb = Runbook {
            name: None,
            steps: vec![step("a", "mcp_runbook")],
            template_missing: None,
        };
        assert_eq!(rb.validate().unwrap_err().code, ErrorCode::RunbookNested);
    }

    #[test]
    fn foreach_and_retry_are_exclusive() {
        let mut s = step("a", "mcp_repo");
        s.foreach = Some(Foreach {
            items: json!([]),
            parallel: false,
        });
        s.retry = Some(RetrySpec {
            max_attempts: 2,
            delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: None,
            retry_on_error: true,
            until: None,
        });
        let rb = Runbook {
            name: None,
            steps: vec![s],
            template_missing: None,
        };
        assert_eq!(rb.validate().unwrap_err().code, ErrorCode::RunbookInvalid);
    }

    #[test]
    fn retry_defaults_deserialize() {
        let spec: RetrySpec = serde_json::from_value(json!({"max_attempts": 5})).unwrap();
        assert_eq!(spec.max_attempts, 5);
        assert!(spec.retry_on_error);
        assert_eq!(spec.backoff_factor, 1.0);
        assert!(spec.until.is_none());
    }

    #[test]
    fn trace_child_links_spans() {
        let root = TraceContext::root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }
}
