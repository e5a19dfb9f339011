// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-executor
#![deny(unsafe_code)]

pub mod merge;
pub mod shape;
pub mod spill;

pub use merge::deep_merge;
pub use shape::OutputSpec;
pub use spill::Spiller;

use async_trait::async_trait;
use chrono::Utc;
use osp_artifact::ArtifactStore;
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_paths::Budgets;
use osp_runbook::{Invocation, ToolInvoker, TraceContext};
use osp_secure::redact::{redact_text, redact_value};
use osp_store::{AuditEntry, AuditLog, AuditStatus, NamedStore, Scope, StateStore};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Envelope keys consumed by the executor, stripped before dispatch.
/// `preset` / `preset_name` are stripped separately, and only when they
/// actually named a preset (the preset tool itself carries an object
/// payload under `preset`).
const ENVELOPE_KEYS: &[&str] = &[
    "output",
    "store_as",
    "store_scope",
    "trace_id",
    "parent_span_id",
];

/// Static short aliases for the canonical tool names.
const STATIC_ALIASES: &[(&str, &str)] = &[
    ("ssh", "mcp_ssh_manager"),
    ("sql", "mcp_psql_manager"),
    ("psql", "mcp_psql_manager"),
    ("http", "mcp_api_client"),
    ("api", "mcp_api_client"),
    ("state", "mcp_state"),
    ("repo", "mcp_repo"),
    ("artifacts", "mcp_artifacts"),
    ("context", "mcp_context"),
    ("ctx", "mcp_context"),
    ("runbook", "mcp_runbook"),
    ("intent", "mcp_intent"),
    ("workspace", "mcp_workspace"),
    ("audit", "mcp_audit"),
    ("alias", "mcp_alias"),
    ("preset", "mcp_preset"),
    ("capability", "mcp_capability"),
    ("caps", "mcp_capability"),
    ("env", "mcp_env"),
    ("vault", "mcp_vault"),
    ("job", "mcp_job"),
    ("jobs", "mcp_job"),
    ("pipeline", "mcp_pipeline"),
];

// ---------------------------------------------------------------------------
// Handler seam + envelope
// ---------------------------------------------------------------------------

/// One registered tool. Handlers receive the merged, stripped arguments and
/// the call's trace context.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handle a call and return the raw (unshaped) result.
    async fn handle(&self, args: Value, trace: &TraceContext) -> ToolResult<Value>;
}

/// Envelope metadata returned with every call.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    /// Canonical tool name.
    pub tool: String,
    /// Action inside the tool (empty when the tool has only one).
    pub action: String,
    /// Trace id.
    pub trace_id: String,
    /// Span id of this call.
    pub span_id: String,
    /// Parent span, when nested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// State key the result was stored under, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_as: Option<String>,
    /// Alias the caller used, when different from `tool`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoked_as: Option<String>,
    /// Preset that was merged, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

/// Successful call envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Always `true`; soft failures live inside `result`.
    pub ok: bool,
    /// Shaped, spill-processed result.
    pub result: Value,
    /// Call metadata.
    pub meta: Meta,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The uniform invocation pipeline in front of every tool handler.
pub struct ToolExecutor {
    handlers: RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>,
    aliases: Arc<NamedStore<Value>>,
    presets: Arc<NamedStore<Value>>,
    state: Arc<StateStore>,
    audit: Arc<AuditLog>,
    artifacts: ArtifactStore,
    budgets: Budgets,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools: Vec<String> = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ToolExecutor").field("tools", &tools).finish()
    }
}

impl ToolExecutor {
    /// Wire an executor over its collaborating stores.
    pub fn new(
        aliases: Arc<NamedStore<Value>>,
        presets: Arc<NamedStore<Value>>,
        state: Arc<StateStore>,
        audit: Arc<AuditLog>,
        artifacts: ArtifactStore,
        budgets: Budgets,
    ) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            aliases,
            presets,
            state,
            audit,
            artifacts,
            budgets,
        }
    }

    /// Register a handler under its canonical name.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(name.into(), handler);
    }

    /// Sorted canonical tool names with registered handlers.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Execute a call from the dispatcher: trace ids are read from the
    /// arguments when present, otherwise assigned fresh.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_TOOL` plus whatever the handler surfaces (redacted).
    pub async fn execute(&self, tool: &str, args: Value) -> ToolResult<Envelope> {
        let trace = TraceContext {
            trace_id: args
                .get("trace_id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            span_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: args
                .get("parent_span_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };
        self.execute_with(tool, args, trace).await
    }

    /// Execute a call under an explicit trace context (runbook steps).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`execute`](Self::execute).
    pub async fn execute_with(
        &self,
        tool: &str,
        args: Value,
        trace: TraceContext,
    ) -> ToolResult<Envelope> {
        let start = Instant::now();
        let original_args = args.clone();
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = self.run_pipeline(tool, args, &trace).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok((canonical, invoked_as, preset, shaped, stored_as)) => {
                self.append_audit(
                    &canonical,
                    &action,
                    &trace,
                    invoked_as.as_deref(),
                    &original_args,
                    AuditStatus::Ok,
                    Some(&shaped),
                    None,
                    duration_ms,
                );
                Ok(Envelope {
                    ok: true,
                    result: shaped,
                    meta: Meta {
                        tool: canonical,
                        action,
                        trace_id: trace.trace_id,
                        span_id: trace.span_id,
                        parent_span_id: trace.parent_span_id,
                        duration_ms,
                        stored_as,
                        invoked_as,
                        preset,
                    },
                })
            }
            Err(err) => {
                let redacted = redact_error(err);
                self.append_audit(
                    tool,
                    &action,
                    &trace,
                    None,
                    &original_args,
                    AuditStatus::Error,
                    None,
                    Some(&redacted),
                    duration_ms,
                );
                Err(redacted)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn run_pipeline(
        &self,
        tool: &str,
        args: Value,
        trace: &TraceContext,
    ) -> ToolResult<(String, Option<String>, Option<String>, Value, Option<String>)> {
        // 1. Alias resolution (static table + dynamic store, bounded hops).
        let (canonical, alias_args) = self.resolve_alias(tool)?;
        let invoked_as = (canonical != tool).then(|| tool.to_string());

        let handler = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .get(&canonical)
            .cloned()
            .ok_or_else(|| {
                ToolError::new(ErrorCode::UnknownTool, format!("Unknown tool '{tool}'"))
            })?;

        // 2. Preset merge: preset under alias args under user args.
        let preset_name = args
            .get("preset")
            .or_else(|| args.get("preset_name"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let mut merged = Value::Object(Map::new());
        if let Some(name) = &preset_name {
            let preset = self.presets.get(name).ok_or_else(|| {
                ToolError::new(ErrorCode::UnknownAction, format!("preset '{name}' not found"))
            })?;
            merged = deep_merge(merged, preset);
        }
        if let Some(alias_args) = alias_args {
            merged = deep_merge(merged, alias_args);
        }
        merged = deep_merge(merged, args);

        // 3. Extract envelope-only keys, then strip them.
        let output_spec: Option<OutputSpec> = merged
            .get("output")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| {
                ToolError::new(ErrorCode::UnknownAction, format!("bad output spec: {e}"))
            })?;
        let store_as = merged
            .get("store_as")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let store_scope = merged
            .get("store_scope")
            .and_then(Value::as_str)
            .map(Scope::parse)
            .transpose()?
            .unwrap_or(Scope::Session);
        if let Value::Object(map) = &mut merged {
            for key in ENVELOPE_KEYS {
                map.remove(*key);
            }
            if preset_name.is_some() {
                map.remove("preset");
                map.remove("preset_name");
            }
        }

        debug!(
            target: "osp.executor",
            tool = %canonical,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            "dispatching"
        );

        // 4. Dispatch under the per-call budget.
        let budget = Duration::from_millis(self.budgets.tool_call_timeout_ms);
        let raw = tokio::time::timeout(budget, handler.handle(merged, trace))
            .await
            .map_err(|_| {
                ToolError::new(
                    ErrorCode::Timeout,
                    format!(
                        "tool '{canonical}' exceeded the {}ms call budget",
                        self.budgets.tool_call_timeout_ms
                    ),
                )
            })??;

        // 5. Shape, then spill oversize values.
        let shaped = match output_spec {
            Some(spec) => spec.apply(raw),
            None => raw,
        };
        let mut spiller = Spiller::new(
            &self.artifacts,
            &self.budgets,
            &trace.trace_id,
            &trace.span_id,
        );
        let shaped = spiller.spill(shaped)?;

        // 6. Optional persistence of the shaped result.
        let stored_as = match store_as {
            Some(key) => {
                let scope = match store_scope {
                    Scope::Any => Scope::Session,
                    other => other,
                };
                self.state.set(&key, shaped.clone(), scope)?;
                Some(key)
            }
            None => None,
        };

        Ok((canonical, invoked_as, preset_name, shaped, stored_as))
    }

    fn resolve_alias(&self, tool: &str) -> ToolResult<(String, Option<Value>)> {
        let mut current = tool.to_string();
        let mut alias_args: Option<Value> = None;
        for _ in 0..4 {
            if let Some((_, canonical)) = STATIC_ALIASES.iter().find(|(a, _)| *a == current) {
                current = (*canonical).to_string();
                continue;
            }
            match self.aliases.get(&current) {
                Some(Value::String(next)) => current = next,
                Some(Value::Object(spec)) => {
                    let Some(next) = spec.get("tool").and_then(Value::as_str) else {
                        return Err(ToolError::new(
                            ErrorCode::UnknownTool,
                            format!("alias '{current}' has no target tool"),
                        ));
                    };
                    if let Some(extra) = spec.get("args") {
                        alias_args = Some(match alias_args {
                            Some(existing) => deep_merge(extra.clone(), existing),
                            None => extra.clone(),
                        });
                    }
                    current = next.to_string();
                }
                Some(_) | None => return Ok((current, alias_args)),
            }
        }
        Ok((current, alias_args))
    }

    #[allow(clippy::too_many_arguments)]
    fn append_audit(
        &self,
        tool: &str,
        action: &str,
        trace: &TraceContext,
        invoked_as: Option<&str>,
        input: &Value,
        status: AuditStatus,
        result: Option<&Value>,
        error: Option<&ToolError>,
        duration_ms: u64,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            status,
            tool: tool.to_string(),
            action: action.to_string(),
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            parent_span_id: trace.parent_span_id.clone(),
            invoked_as: invoked_as.map(str::to_owned),
            input: redact_value(input),
            result_summary: result.map(summarize_result),
            error: error.and_then(|e| serde_json::to_value(e).ok()),
            duration_ms,
        };
        if let Err(err) = self.audit.append(&entry) {
            warn!(target: "osp.executor", %err, "audit append failed");
        }
    }
}

/// Summarize a result for audit: type tag plus a short redacted preview.
fn summarize_result(result: &Value) -> Value {
    let type_name = match result {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    let preview_source = redact_value(result).to_string();
    let preview: String = preview_source.chars().take(200).collect();
    json!({"type": type_name, "preview": preview})
}

fn redact_error(mut err: ToolError) -> ToolError {
    err.message = redact_text(&err.message);
    if let Some(hint) = err.hint.take() {
        err.hint = Some(redact_text(&hint));
    }
    if let Some(details) = err.details.take() {
        err.details = Some(redact_value(&details));
    }
    err
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    async fn invoke(
        &self,
        tool: &str,
        args: Value,
        trace: &TraceContext,
    ) -> ToolResult<Invocation> {
        let envelope = self.execute_with(tool, args, trace.clone()).await?;
        Ok(Invocation {
            result: envelope.result,
            meta: serde_json::to_value(&envelope.meta)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
