// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool handlers registered against the execution envelope.

use async_trait::async_trait;
use osp_artifact::{ArtifactStore, ReadEncoding};
use osp_capability::{Capability, CapabilityRegistry};
use osp_context::{ContextDetector, ContextQuery};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_executor::{ToolExecutor, ToolHandler};
use osp_intent::{ExecuteOptions, Intent, IntentPlanner};
use osp_protocol::catalog;
use osp_runbook::{Runbook, RunbookEngine, TraceContext};
use osp_runner::{ExecOutcome, ExecRequest, SafeRunner};
use osp_store::{
    AuditFilter, AuditLog, AuditStatus, JobStatus, JobStore, NamedStore, ProfileStore,
    ProfileUpdate, Scope, SecretsUpdate, StateStore,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collaborators shared by the handler set.
pub struct HandlerDeps {
    /// Context detector.
    pub detector: Arc<ContextDetector>,
    /// Artifact store.
    pub artifacts: ArtifactStore,
    /// Safe command runner.
    pub runner: SafeRunner,
    /// Key/value state store.
    pub state: Arc<StateStore>,
    /// Profile store.
    pub profiles: Arc<ProfileStore>,
    /// Runbook registry.
    pub runbooks: Arc<NamedStore<Runbook>>,
    /// Runbook engine.
    pub engine: Arc<RunbookEngine>,
    /// Dynamic alias store.
    pub aliases: Arc<NamedStore<Value>>,
    /// Preset store.
    pub presets: Arc<NamedStore<Value>>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Capability registry.
    pub capabilities: Arc<CapabilityRegistry>,
    /// Intent planner.
    pub planner: Arc<IntentPlanner>,
    /// Job store.
    pub jobs: Arc<JobStore>,
}

/// Register every core handler plus the external-collaborator stubs.
pub fn register_all(executor: &ToolExecutor, deps: HandlerDeps) {
    executor.register(
        "help",
        Arc::new(HelpHandler {
            aliases: Arc::clone(&deps.aliases),
        }),
    );
    executor.register("legend", Arc::new(LegendHandler));
    executor.register(
        "mcp_context",
        Arc::new(ContextHandler {
            detector: deps.detector,
        }),
    );
    executor.register(
        "mcp_artifacts",
        Arc::new(ArtifactsHandler {
            artifacts: deps.artifacts,
        }),
    );
    executor.register("mcp_repo", Arc::new(RepoHandler { runner: deps.runner }));
    executor.register("mcp_state", Arc::new(StateHandler { state: deps.state }));
    executor.register(
        "mcp_env",
        Arc::new(ProfileHandler {
            profiles: deps.profiles,
        }),
    );
    executor.register(
        "mcp_runbook",
        Arc::new(RunbookHandler {
            runbooks: Arc::clone(&deps.runbooks),
            engine: deps.engine,
        }),
    );
    executor.register(
        "mcp_alias",
        Arc::new(AliasHandler {
            aliases: deps.aliases,
        }),
    );
    executor.register(
        "mcp_preset",
        Arc::new(PresetHandler {
            presets: deps.presets,
        }),
    );
    executor.register("mcp_audit", Arc::new(AuditHandler { audit: deps.audit }));
    executor.register(
        "mcp_capability",
        Arc::new(CapabilityHandler {
            capabilities: deps.capabilities,
        }),
    );
    executor.register(
        "mcp_intent",
        Arc::new(IntentHandler {
            planner: Arc::clone(&deps.planner),
        }),
    );
    executor.register(
        "mcp_workspace",
        Arc::new(WorkspaceHandler {
            planner: deps.planner,
        }),
    );
    executor.register("mcp_job", Arc::new(JobHandler { jobs: deps.jobs }));

    for name in [
        "mcp_psql_manager",
        "mcp_ssh_manager",
        "mcp_api_client",
        "mcp_pipeline",
        "mcp_vault",
    ] {
        executor.register(name, Arc::new(ExternalStub { name }));
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn action<'a>(args: &'a Value, default: &'a str) -> &'a str {
    args.get("action").and_then(Value::as_str).unwrap_or(default)
}

fn required_str(args: &Value, key: &str) -> ToolResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            ToolError::new(ErrorCode::MissingInputs, format!("'{key}' is required"))
        })
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn opt_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn unknown_action(tool: &str, raw: &str) -> ToolError {
    ToolError::new(
        ErrorCode::UnknownAction,
        format!("unknown action '{raw}' for {tool}"),
    )
}

// ---------------------------------------------------------------------------
// help / legend
// ---------------------------------------------------------------------------

struct HelpHandler {
    aliases: Arc<NamedStore<Value>>,
}

#[async_trait]
impl ToolHandler for HelpHandler {
    async fn handle(&self, _args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let tools: Vec<Value> = catalog()
            .into_iter()
            .map(|t| json!({"name": t.name, "description": t.description}))
            .collect();
        Ok(json!({
            "tools": tools,
            "aliases": self.aliases.names(),
            "conventions": {
                "envelope_keys": ["output", "store_as", "store_scope", "preset"],
                "apply": "write effects execute only with apply: true",
                "artifacts": "large values spill to artifact:// URIs; read them with mcp_artifacts",
            },
        }))
    }
}

struct LegendHandler;

#[async_trait]
impl ToolHandler for LegendHandler {
    async fn handle(&self, _args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        Ok(json!({
            "intents": [
                "gitops.status", "gitops.plan", "gitops.propose", "gitops.sync",
                "gitops.verify", "gitops.rollback", "gitops.release",
            ],
            "gates": ["apply", "policy.remotes", "policy.change_windows", "policy.lock"],
            "stores": ["state", "profiles", "runbooks", "capabilities", "aliases", "presets"],
        }))
    }
}

// ---------------------------------------------------------------------------
// mcp_context
// ---------------------------------------------------------------------------

struct ContextHandler {
    detector: Arc<ContextDetector>,
}

#[async_trait]
impl ToolHandler for ContextHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let mut query: ContextQuery = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::new(ErrorCode::MissingInputs, format!("bad query: {e}")))?;
        match action(&args, "get") {
            "get" => {}
            "refresh" => query.refresh = true,
            other => return Err(unknown_action("mcp_context", other)),
        }
        let record = self.detector.get(&query)?;
        Ok(serde_json::to_value(record)?)
    }
}

// ---------------------------------------------------------------------------
// mcp_artifacts
// ---------------------------------------------------------------------------

struct ArtifactsHandler {
    artifacts: ArtifactStore,
}

#[async_trait]
impl ToolHandler for ArtifactsHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let encoding = match opt_str(&args, "encoding").as_deref() {
            None | Some("utf8") => ReadEncoding::Utf8,
            Some("base64") => ReadEncoding::Base64,
            Some(other) => {
                return Err(ToolError::new(
                    ErrorCode::MissingInputs,
                    format!("unknown encoding '{other}'"),
                ))
            }
        };
        let target = || -> ToolResult<String> {
            opt_str(&args, "uri")
                .or_else(|| opt_str(&args, "rel"))
                .ok_or_else(|| {
                    ToolError::new(ErrorCode::MissingInputs, "'uri' or 'rel' is required")
                })
        };
        let max_bytes = opt_usize(&args, "max_bytes");

        let result = match action(&args, "get") {
            "get" => {
                let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0);
                serde_json::to_value(self.artifacts.get(&target()?, offset, max_bytes, encoding)?)?
            }
            "head" => serde_json::to_value(self.artifacts.head(&target()?, max_bytes, encoding)?)?,
            "tail" => serde_json::to_value(self.artifacts.tail(&target()?, max_bytes, encoding)?)?,
            "list" => {
                let prefix = opt_str(&args, "prefix").unwrap_or_default();
                let entries = self.artifacts.list(&prefix, opt_usize(&args, "limit"))?;
                let count = entries.len();
                json!({"entries": entries, "count": count})
            }
            other => return Err(unknown_action("mcp_artifacts", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_repo
// ---------------------------------------------------------------------------

struct RepoHandler {
    runner: SafeRunner,
}

#[async_trait]
impl ToolHandler for RepoHandler {
    async fn handle(&self, args: Value, trace: &TraceContext) -> ToolResult<Value> {
        let apply = args.get("apply").and_then(Value::as_bool).unwrap_or(false);
        let trace_id = trace.trace_id.as_str();
        let span_id = trace.span_id.as_str();

        let result = match action(&args, "exec") {
            "exec" => {
                let request: ExecRequest = serde_json::from_value(args.clone()).map_err(|e| {
                    ToolError::new(ErrorCode::MissingInputs, format!("bad exec request: {e}"))
                })?;
                match self.runner.exec(request, trace_id, span_id).await? {
                    ExecOutcome::Completed(result) => serde_json::to_value(result)?,
                    detached @ ExecOutcome::Detached { .. } => serde_json::to_value(detached)?,
                }
            }
            "apply_patch" => {
                let patch = required_str(&args, "patch")?;
                serde_json::to_value(
                    self.runner.apply_patch(&patch, apply, trace_id, span_id).await?,
                )?
            }
            "git_commit" => {
                let message = required_str(&args, "message")?;
                serde_json::to_value(
                    self.runner.git_commit(&message, apply, trace_id, span_id).await?,
                )?
            }
            "git_push" => {
                let remote = opt_str(&args, "remote").unwrap_or_else(|| "origin".into());
                let refspec = required_str(&args, "refspec")?;
                serde_json::to_value(
                    self.runner
                        .git_push(&remote, &refspec, apply, trace_id, span_id)
                        .await?,
                )?
            }
            "git_revert" => {
                let commit = required_str(&args, "commit")?;
                serde_json::to_value(
                    self.runner.git_revert(&commit, apply, trace_id, span_id).await?,
                )?
            }
            other => return Err(unknown_action("mcp_repo", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_state
// ---------------------------------------------------------------------------

struct StateHandler {
    state: Arc<StateStore>,
}

#[async_trait]
impl ToolHandler for StateHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let scope = match opt_str(&args, "scope") {
            Some(raw) => Scope::parse(&raw)?,
            None => Scope::Any,
        };
        let result = match action(&args, "get") {
            "get" => {
                let key = required_str(&args, "key")?;
                let value = self.state.get(&key, scope);
                json!({"key": key, "found": value.is_some(), "value": value})
            }
            "set" => {
                let key = required_str(&args, "key")?;
                let value = args.get("value").cloned().ok_or_else(|| {
                    ToolError::new(ErrorCode::MissingInputs, "'value' is required")
                })?;
                let scope = match scope {
                    Scope::Any => Scope::Session,
                    other => other,
                };
                self.state.set(&key, value, scope)?;
                json!({"key": key, "stored": true})
            }
            "unset" => {
                let key = required_str(&args, "key")?;
                json!({"key": key, "removed": self.state.unset(&key, scope)?})
            }
            "list" => json!({"keys": self.state.list(scope)}),
            "dump" => serde_json::to_value(self.state.dump(scope))?,
            "clear" => {
                self.state.clear(scope)?;
                json!({"cleared": true})
            }
            other => return Err(unknown_action("mcp_state", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_env (profiles)
// ---------------------------------------------------------------------------

struct ProfileHandler {
    profiles: Arc<ProfileStore>,
}

#[async_trait]
impl ToolHandler for ProfileHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let result = match action(&args, "profile_list") {
            "profile_set" => {
                let name = required_str(&args, "name")?;
                let data = args.get("data").and_then(Value::as_object).map(|map| {
                    map.iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<BTreeMap<_, _>>()
                });
                let secrets = match args.get("secrets") {
                    None => SecretsUpdate::Keep,
                    Some(Value::Null) => SecretsUpdate::Clear,
                    Some(Value::Object(map)) => SecretsUpdate::Merge(
                        map.iter()
                            .map(|(k, v)| {
                                (k.clone(), v.as_str().map(str::to_owned))
                            })
                            .collect(),
                    ),
                    Some(_) => {
                        return Err(ToolError::new(
                            ErrorCode::MissingInputs,
                            "'secrets' must be an object or null",
                        ))
                    }
                };
                let summary = self.profiles.set(
                    &name,
                    ProfileUpdate {
                        profile_type: opt_str(&args, "type"),
                        data,
                        secrets,
                    },
                )?;
                serde_json::to_value(summary)?
            }
            "profile_get" => {
                let name = required_str(&args, "name")?;
                let view = self.profiles.get(&name, opt_str(&args, "type").as_deref())?;
                let reveal = args.get("reveal").and_then(Value::as_bool).unwrap_or(false);
                if reveal {
                    if !osp_paths::env_truthy(osp_artifact::ENV_ALLOW_SECRET_EXPORT) {
                        return Err(ToolError::new(
                            ErrorCode::SecretExportDisabled,
                            "revealing decrypted secrets is disabled",
                        )
                        .with_hint("set SF_ALLOW_SECRET_EXPORT=1 to allow"));
                    }
                    serde_json::to_value(view)?
                } else {
                    json!({
                        "name": view.name,
                        "type": view.profile_type,
                        "data": view.data,
                        "secret_fields": view.secrets.keys().collect::<Vec<_>>(),
                    })
                }
            }
            "profile_list" => {
                serde_json::to_value(self.profiles.list(opt_str(&args, "type").as_deref()))?
            }
            "profile_delete" => {
                let name = required_str(&args, "name")?;
                self.profiles.delete(&name)?;
                json!({"deleted": name})
            }
            other => return Err(unknown_action("mcp_env", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_runbook
// ---------------------------------------------------------------------------

struct RunbookHandler {
    runbooks: Arc<NamedStore<Runbook>>,
    engine: Arc<RunbookEngine>,
}

#[async_trait]
impl ToolHandler for RunbookHandler {
    async fn handle(&self, args: Value, trace: &TraceContext) -> ToolResult<Value> {
        let result = match action(&args, "run") {
            "run" => {
                let name = required_str(&args, "name")?;
                let runbook = self.runbooks.get(&name).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::RunbookNotFound,
                        format!("runbook '{name}' not found"),
                    )
                })?;
                let input = args.get("input").cloned().unwrap_or_else(|| json!({}));
                let outcome = self.engine.run(&runbook, input, trace).await?;
                serde_json::to_value(outcome)?
            }
            "get" => {
                let name = required_str(&args, "name")?;
                let runbook = self.runbooks.get(&name).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::RunbookNotFound,
                        format!("runbook '{name}' not found"),
                    )
                })?;
                serde_json::to_value(runbook)?
            }
            "set" => {
                let name = required_str(&args, "name")?;
                let runbook: Runbook = serde_json::from_value(
                    args.get("runbook").cloned().ok_or_else(|| {
                        ToolError::new(ErrorCode::MissingInputs, "'runbook' is required")
                    })?,
                )
                .map_err(|e| {
                    ToolError::new(ErrorCode::RunbookInvalid, format!("bad runbook: {e}"))
                })?;
                runbook.validate()?;
                self.runbooks.set(&name, runbook)?;
                json!({"stored": name})
            }
            "delete" => {
                let name = required_str(&args, "name")?;
                if !self.runbooks.delete(&name)? {
                    return Err(ToolError::new(
                        ErrorCode::RunbookNotFound,
                        format!("runbook '{name}' not found"),
                    ));
                }
                json!({"deleted": name})
            }
            "list" => json!({"runbooks": self.runbooks.names()}),
            other => return Err(unknown_action("mcp_runbook", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_alias / mcp_preset
// ---------------------------------------------------------------------------

struct AliasHandler {
    aliases: Arc<NamedStore<Value>>,
}

#[async_trait]
impl ToolHandler for AliasHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        crud_named(&self.aliases, &args, "alias", |value| {
            let valid = value.is_string()
                || value
                    .get("tool")
                    .map(Value::is_string)
                    .unwrap_or(false);
            if valid {
                Ok(())
            } else {
                Err(ToolError::new(
                    ErrorCode::MissingInputs,
                    "alias must be a tool name or {tool, args}",
                ))
            }
        })
    }
}

struct PresetHandler {
    presets: Arc<NamedStore<Value>>,
}

#[async_trait]
impl ToolHandler for PresetHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        crud_named(&self.presets, &args, "preset", |value| {
            if value.is_object() {
                Ok(())
            } else {
                Err(ToolError::new(
                    ErrorCode::MissingInputs,
                    "preset must be an object of default arguments",
                ))
            }
        })
    }
}

fn crud_named(
    store: &NamedStore<Value>,
    args: &Value,
    payload_key: &str,
    validate: impl Fn(&Value) -> ToolResult<()>,
) -> ToolResult<Value> {
    let result = match action(args, "list") {
        "get" => {
            let name = required_str(args, "name")?;
            let record = store.get(&name).ok_or_else(|| {
                ToolError::new(
                    ErrorCode::UnknownTool,
                    format!("{payload_key} '{name}' not found"),
                )
            })?;
            json!({"name": name, payload_key: record})
        }
        "set" => {
            let name = required_str(args, "name")?;
            let record = args.get(payload_key).cloned().ok_or_else(|| {
                ToolError::new(
                    ErrorCode::MissingInputs,
                    format!("'{payload_key}' is required"),
                )
            })?;
            validate(&record)?;
            store.set(&name, record)?;
            json!({"stored": name})
        }
        "delete" => {
            let name = required_str(args, "name")?;
            if !store.delete(&name)? {
                return Err(ToolError::new(
                    ErrorCode::UnknownTool,
                    format!("{payload_key} '{name}' not found"),
                ));
            }
            json!({"deleted": name})
        }
        "list" => json!({"names": store.names()}),
        other => {
            return Err(unknown_action(
                if payload_key == "alias" { "mcp_alias" } else { "mcp_preset" },
                other,
            ))
        }
    };
    Ok(result)
}

// ---------------------------------------------------------------------------
// mcp_audit
// ---------------------------------------------------------------------------

struct AuditHandler {
    audit: Arc<AuditLog>,
}

#[async_trait]
impl ToolHandler for AuditHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        match action(&args, "read") {
            "read" => {
                let status = match opt_str(&args, "status").as_deref() {
                    None => None,
                    Some("ok") => Some(AuditStatus::Ok),
                    Some("error") => Some(AuditStatus::Error),
                    Some(other) => {
                        return Err(ToolError::new(
                            ErrorCode::MissingInputs,
                            format!("unknown status '{other}'"),
                        ))
                    }
                };
                let entries = self.audit.read(&AuditFilter {
                    limit: opt_usize(&args, "limit"),
                    tool: opt_str(&args, "tool"),
                    status,
                    trace_id: opt_str(&args, "trace_id"),
                })?;
                Ok(json!({"entries": entries}))
            }
            other => Err(unknown_action("mcp_audit", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// mcp_capability
// ---------------------------------------------------------------------------

struct CapabilityHandler {
    capabilities: Arc<CapabilityRegistry>,
}

#[async_trait]
impl ToolHandler for CapabilityHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let result = match action(&args, "list") {
            "get" => {
                let name = required_str(&args, "name")?;
                let cap = self.capabilities.get(&name).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::CapabilityNotFound,
                        format!("capability '{name}' not found"),
                    )
                })?;
                serde_json::to_value(cap)?
            }
            "set" => {
                let name = required_str(&args, "name")?;
                let cap: Capability = serde_json::from_value(
                    args.get("capability").cloned().ok_or_else(|| {
                        ToolError::new(ErrorCode::MissingInputs, "'capability' is required")
                    })?,
                )
                .map_err(|e| {
                    ToolError::new(
                        ErrorCode::CapabilityInvalid,
                        format!("bad capability: {e}"),
                    )
                })?;
                self.capabilities.set(&name, cap)?;
                json!({"stored": name})
            }
            "delete" => {
                let name = required_str(&args, "name")?;
                self.capabilities.delete(&name)?;
                json!({"deleted": name})
            }
            "list" => match opt_str(&args, "intent") {
                Some(intent) => serde_json::to_value(self.capabilities.list_for_intent(&intent))?,
                None => json!({"names": self.capabilities.names()}),
            },
            other => return Err(unknown_action("mcp_capability", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// mcp_intent / mcp_workspace
// ---------------------------------------------------------------------------

struct IntentHandler {
    planner: Arc<IntentPlanner>,
}

#[async_trait]
impl ToolHandler for IntentHandler {
    async fn handle(&self, args: Value, trace: &TraceContext) -> ToolResult<Value> {
        let intent: Intent = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::new(ErrorCode::MissingInputs, format!("bad intent: {e}")))?;
        if intent.intent_type.is_empty() {
            return Err(ToolError::new(ErrorCode::MissingInputs, "'type' is required"));
        }
        let result = match action(&args, "compile") {
            "compile" => serde_json::to_value(self.planner.compile(&intent)?)?,
            "dry_run" => serde_json::to_value(self.planner.dry_run(&intent)?)?,
            "execute" => {
                let options: ExecuteOptions =
                    serde_json::from_value(args.clone()).unwrap_or_default();
                serde_json::to_value(self.planner.execute(&intent, &options, trace).await?)?
            }
            other => return Err(unknown_action("mcp_intent", other)),
        };
        Ok(result)
    }
}

struct WorkspaceHandler {
    planner: Arc<IntentPlanner>,
}

#[async_trait]
impl ToolHandler for WorkspaceHandler {
    async fn handle(&self, args: Value, trace: &TraceContext) -> ToolResult<Value> {
        let intent = Intent {
            intent_type: required_str(&args, "intent_type")?,
            inputs: args
                .get("inputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(Map::new),
            apply: args.get("apply").and_then(Value::as_bool).unwrap_or(false),
            project: opt_str(&args, "project"),
            target: opt_str(&args, "target"),
            context: None,
        };
        let result = match action(&args, "run") {
            "compile" => serde_json::to_value(self.planner.compile(&intent)?)?,
            "dry_run" => serde_json::to_value(self.planner.dry_run(&intent)?)?,
            "run" => {
                let options: ExecuteOptions =
                    serde_json::from_value(args.clone()).unwrap_or_default();
                let report = self.planner.execute(&intent, &options, trace).await?;
                let mut value = serde_json::to_value(&report)?;
                attach_run_context(&mut value, &report, trace);
                value
            }
            other => return Err(unknown_action("mcp_workspace", other)),
        };
        Ok(result)
    }
}

/// Summarize a workspace run as a context artifact: one `R:` line per
/// artifact reference the steps produced, so an agent can pick up every
/// output with a single read.
fn attach_run_context(value: &mut Value, report: &osp_intent::ExecutionReport, trace: &TraceContext) {
    let mut uris = Vec::new();
    collect_artifact_uris(&serde_json::to_value(&report.steps).unwrap_or(Value::Null), &mut uris);
    uris.sort();
    uris.dedup();
    value["artifact_uris"] = json!(uris);
    value["trace_id"] = json!(trace.trace_id);
}

fn collect_artifact_uris(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with("artifact://") => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_artifact_uris(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_artifact_uris(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// mcp_job
// ---------------------------------------------------------------------------

struct JobHandler {
    jobs: Arc<JobStore>,
}

#[async_trait]
impl ToolHandler for JobHandler {
    async fn handle(&self, args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        let result = match action(&args, "list") {
            "get" => {
                let job_id = required_str(&args, "job_id")?;
                serde_json::to_value(self.jobs.get(&job_id)?)?
            }
            "list" => {
                let status = opt_str(&args, "status").and_then(|s| JobStatus::parse(&s));
                json!({"jobs": self.jobs.list(opt_usize(&args, "limit"), status)})
            }
            "forget" => {
                let job_id = required_str(&args, "job_id")?;
                self.jobs.forget(&job_id)?;
                json!({"forgotten": job_id})
            }
            other => return Err(unknown_action("mcp_job", other)),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// External collaborator stubs
// ---------------------------------------------------------------------------

struct ExternalStub {
    name: &'static str,
}

#[async_trait]
impl ToolHandler for ExternalStub {
    async fn handle(&self, _args: Value, _trace: &TraceContext) -> ToolResult<Value> {
        Err(ToolError::new(
            ErrorCode::ExternalToolUnavailable,
            format!("'{}' is an external collaborator not wired into this build", self.name),
        )
        .with_hint("deploy the infrastructure client alongside the control plane"))
    }
}
