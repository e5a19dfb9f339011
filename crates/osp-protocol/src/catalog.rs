// SPDX-License-Identifier: MIT OR Apache-2.0
//! The tool catalog served by `tools/list`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Canonical tool name.
    pub name: String,
    /// One-line description for the agent.
    pub description: String,
    /// JSON schema of the tool's arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": true,
        }),
    }
}

fn action_property(actions: &[&str]) -> Value {
    json!({"type": "string", "enum": actions})
}

/// Build the full catalog of canonical tools.
#[must_use]
pub fn catalog() -> Vec<ToolDescriptor> {
    vec![
        tool(
            "help",
            "Describe the available tools, aliases, and calling conventions",
            json!({"topic": {"type": "string"}}),
            &[],
        ),
        tool(
            "legend",
            "Compact cheat-sheet of tools, intents, and envelope keys",
            json!({}),
            &[],
        ),
        tool(
            "mcp_context",
            "Detect or fetch the context record (tags, signals, git root) for a project/target or cwd",
            json!({
                "action": action_property(&["get", "refresh"]),
                "project": {"type": "string"},
                "target": {"type": "string"},
                "cwd": {"type": "string"},
                "repo_root": {"type": "string"},
                "refresh": {"type": "boolean"},
            }),
            &[],
        ),
        tool(
            "mcp_artifacts",
            "Bounded reads over run artifacts: get, head, tail, list",
            json!({
                "action": action_property(&["get", "head", "tail", "list"]),
                "uri": {"type": "string"},
                "rel": {"type": "string"},
                "prefix": {"type": "string"},
                "offset": {"type": "integer", "minimum": 0},
                "max_bytes": {"type": "integer", "minimum": 0},
                "limit": {"type": "integer", "minimum": 1},
                "encoding": {"type": "string", "enum": ["utf8", "base64"]},
            }),
            &["action"],
        ),
        tool(
            "mcp_repo",
            "Safe allowlisted command execution confined to the repo root; write actions need apply",
            json!({
                "action": action_property(&[
                    "exec", "apply_patch", "git_commit", "git_push", "git_revert"
                ]),
                "command": {"type": "string"},
                "args": {"type": "array", "items": {"type": "string"}},
                "cwd": {"type": "string"},
                "env": {"type": "object"},
                "stdin": {"type": "string"},
                "timeout_ms": {"type": "integer", "minimum": 1},
                "detach": {"type": "boolean"},
                "patch": {"type": "string"},
                "message": {"type": "string"},
                "remote": {"type": "string"},
                "refspec": {"type": "string"},
                "commit": {"type": "string"},
                "apply": {"type": "boolean"},
            }),
            &["action"],
        ),
        tool(
            "mcp_workspace",
            "Run GitOps intents (gitops.status/plan/propose/sync/verify/rollback/release) end to end",
            json!({
                "action": action_property(&["run", "compile", "dry_run"]),
                "intent_type": {"type": "string"},
                "inputs": {"type": "object"},
                "apply": {"type": "boolean"},
                "project": {"type": "string"},
                "target": {"type": "string"},
                "save_evidence": {"type": "boolean"},
                "skip_plan_check": {"type": "boolean"},
            }),
            &["intent_type"],
        ),
        tool(
            "mcp_state",
            "Session/persistent key-value store: get, set, unset, list, dump, clear",
            json!({
                "action": action_property(&["get", "set", "unset", "list", "dump", "clear"]),
                "key": {"type": "string"},
                "value": {},
                "scope": {"type": "string", "enum": ["session", "persistent", "any"]},
            }),
            &["action"],
        ),
        tool(
            "mcp_runbook",
            "Manage and run stored runbooks",
            json!({
                "action": action_property(&["run", "get", "set", "delete", "list"]),
                "name": {"type": "string"},
                "runbook": {"type": "object"},
                "input": {"type": "object"},
            }),
            &["action"],
        ),
        tool(
            "mcp_alias",
            "Manage dynamic tool aliases",
            json!({
                "action": action_property(&["get", "set", "delete", "list"]),
                "name": {"type": "string"},
                "alias": {},
            }),
            &["action"],
        ),
        tool(
            "mcp_preset",
            "Manage argument presets merged under tool calls",
            json!({
                "action": action_property(&["get", "set", "delete", "list"]),
                "name": {"type": "string"},
                "preset": {"type": "object"},
            }),
            &["action"],
        ),
        tool(
            "mcp_audit",
            "Read the append-only audit log with filters",
            json!({
                "action": action_property(&["read"]),
                "limit": {"type": "integer", "minimum": 1},
                "tool": {"type": "string"},
                "status": {"type": "string", "enum": ["ok", "error"]},
                "trace_id": {"type": "string"},
            }),
            &[],
        ),
        tool(
            "mcp_capability",
            "Manage the capability registry routing intents to runbooks",
            json!({
                "action": action_property(&["get", "set", "delete", "list"]),
                "name": {"type": "string"},
                "capability": {"type": "object"},
                "intent": {"type": "string"},
            }),
            &["action"],
        ),
        tool(
            "mcp_intent",
            "Compile, dry-run, or execute an intent through the capability planner",
            json!({
                "action": action_property(&["compile", "dry_run", "execute"]),
                "type": {"type": "string"},
                "inputs": {"type": "object"},
                "apply": {"type": "boolean"},
                "project": {"type": "string"},
                "target": {"type": "string"},
                "stop_on_error": {"type": "boolean"},
                "save_evidence": {"type": "boolean"},
                "skip_plan_check": {"type": "boolean"},
            }),
            &["action", "type"],
        ),
        tool(
            "mcp_job",
            "Inspect background jobs: get, list, forget",
            json!({
                "action": action_property(&["get", "list", "forget"]),
                "job_id": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1},
                "status": {
                    "type": "string",
                    "enum": ["queued", "running", "succeeded", "failed", "canceled"],
                },
            }),
            &["action"],
        ),
        // Infrastructure clients are out-of-process collaborators; the
        // catalog reserves their names so aliases and audit stay stable.
        tool(
            "mcp_psql_manager",
            "PostgreSQL client (external collaborator)",
            json!({"action": {"type": "string"}, "profile": {"type": "string"}}),
            &[],
        ),
        tool(
            "mcp_ssh_manager",
            "SSH client (external collaborator)",
            json!({"action": {"type": "string"}, "profile": {"type": "string"}}),
            &[],
        ),
        tool(
            "mcp_api_client",
            "HTTP client (external collaborator)",
            json!({"action": {"type": "string"}, "profile": {"type": "string"}}),
            &[],
        ),
        tool(
            "mcp_pipeline",
            "CI pipeline client (external collaborator)",
            json!({"action": {"type": "string"}}),
            &[],
        ),
        tool(
            "mcp_env",
            "Manage typed connection profiles: non-secret data plus sealed secrets",
            json!({
                "action": action_property(&[
                    "profile_set", "profile_get", "profile_list", "profile_delete"
                ]),
                "name": {"type": "string"},
                "type": {"type": "string"},
                "data": {"type": "object"},
                "secrets": {"type": ["object", "null"]},
                "reveal": {"type": "boolean"},
            }),
            &[],
        ),
        tool(
            "mcp_vault",
            "Vault client (external collaborator)",
            json!({"action": {"type": "string"}, "profile": {"type": "string"}}),
            &[],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
