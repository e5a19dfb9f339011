// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios through the full wiring: dispatcher, envelope,
//! planner, runbook engine, runner, stores.

use osp_server::{build_state, AppState};
use serde_json::{json, Value};
use serial_test::serial;
use std::path::Path;

/// Stage a process env var. Tests are serialized, so the env is ours.
fn set_env(key: &str, value: impl AsRef<std::ffi::OsStr>) {
    unsafe { std::env::set_var(key, value) };
}

fn unset_env(key: &str) {
    unsafe { std::env::remove_var(key) };
}

/// Scoped environment for one scenario: fresh state dir + context root.
struct Harness {
    tmp: tempfile::TempDir,
    state: AppState,
}

impl Harness {
    fn new(extra_env: &[(&str, String)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("ctx")).unwrap();
        set_env("MCP_PROFILES_DIR", tmp.path().join("state"));
        set_env("SF_CONTEXT_REPO_ROOT", tmp.path().join("ctx"));
        for (key, value) in extra_env {
            set_env(key, value);
        }
        let state = build_state().expect("control plane builds");
        Self { tmp, state }
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value, osp_error::ToolError> {
        self.state
            .executor
            .execute(tool, args)
            .await
            .map(|envelope| json!({"result": envelope.result, "meta": {
                "tool": envelope.meta.tool,
                "trace_id": envelope.meta.trace_id,
                "span_id": envelope.meta.span_id,
            }}))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for key in [
            "MCP_PROFILES_DIR",
            "SF_CONTEXT_REPO_ROOT",
            "SF_REPO_ALLOWED_COMMANDS",
            "SF_REPO_EXEC_MAX_CAPTURE_BYTES",
            "SF_REPO_EXEC_MAX_INLINE_BYTES",
            "SF_MAX_INLINE_BYTES",
        ] {
            unset_env(key);
        }
    }
}

fn flux_context(root: &Path) -> Value {
    json!({
        "key": "cwd:test",
        "root": root.display().to_string(),
        "cwd": root.display().to_string(),
        "tags": ["flux", "git", "gitops"],
        "signals": {"flux": true},
        "files": {},
        "updated_at": "2026-01-01T00:00:00Z",
    })
}

async fn seed_capability(h: &Harness, name: &str, intent: &str, runbook: &str, write: bool) {
    let effects = if write {
        json!({"kind": "write", "requires_apply": true})
    } else {
        json!({"kind": "read", "requires_apply": false})
    };
    h.call(
        "mcp_capability",
        json!({"action": "set", "name": name, "capability": {
            "intent": intent,
            "runbook": runbook,
            "inputs": {"pass_through": true},
            "effects": effects,
        }}),
    )
    .await
    .expect("capability stored");
}

async fn seed_runbook(h: &Harness, name: &str) {
    h.call(
        "mcp_runbook",
        json!({"action": "set", "name": name, "runbook": {
            "steps": [{
                "id": "mark",
                "tool": "mcp_state",
                "args": {"action": "set", "key": format!("ran.{name}"),
                          "value": "{{ input.overlay }}", "scope": "session"},
            }],
        }}),
    )
    .await
    .expect("runbook stored");
}

#[tokio::test]
#[serial]
async fn apply_gate_denies_then_executes_with_evidence() {
    let h = Harness::new(&[]);
    seed_capability(&h, "k8s.apply", "k8s.apply", "rb.apply", true).await;
    seed_runbook(&h, "rb.apply").await;

    // Without apply: denied before any runbook runs.
    let err = h
        .call(
            "mcp_intent",
            json!({"action": "execute", "type": "k8s.apply",
                   "inputs": {"overlay": "/repo/o"}}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, osp_error::ErrorKind::Denied);
    assert_eq!(err.code, osp_error::ErrorCode::ApplyRequired);

    // With apply: executes and persists an evidence bundle.
    let out = h
        .call(
            "mcp_intent",
            json!({"action": "execute", "type": "k8s.apply", "apply": true,
                   "inputs": {"overlay": "/repo/o"}, "save_evidence": true}),
        )
        .await
        .unwrap();
    assert_eq!(out["result"]["success"], true);
    let evidence = out["result"]["evidence_path"].as_str().unwrap();
    let raw = std::fs::read_to_string(evidence).unwrap();
    assert!(raw.contains("\"success\": true"));
}

#[tokio::test]
#[serial]
async fn runner_budgets_spill_stdout_to_artifacts() {
    let h = Harness::new(&[
        ("SF_REPO_ALLOWED_COMMANDS", "cat".to_string()),
        ("SF_REPO_EXEC_MAX_CAPTURE_BYTES", "1024".to_string()),
        ("SF_REPO_EXEC_MAX_INLINE_BYTES", "128".to_string()),
    ]);
    // The runner is confined to the context root; place the big file there.
    let repo = h.tmp.path().join("ctx");
    std::fs::write(repo.join("big.txt"), "x".repeat(600 * 1024)).unwrap();

    let out = h
        .call(
            "mcp_repo",
            json!({"action": "exec", "command": "cat", "args": ["big.txt"],
                   "trace_id": "t-spill"}),
        )
        .await
        .unwrap();
    let result = &out["result"];
    assert_eq!(result["stdout_captured_bytes"], 1024);
    assert_eq!(result["stdout_truncated"], true);
    assert_eq!(result["stdout_inline_truncated"], true);
    assert!(result["stdout_inline"].as_str().unwrap().len() <= 128);
    let rel = result["stdout_ref"]["rel"].as_str().unwrap();
    assert!(rel.starts_with("runs/t-spill/tool_calls/"));
    assert!(rel.ends_with("/stdout.log"));
    assert_eq!(result["stdout_ref"]["bytes"], 1024);

    // The spill is readable back through the artifact tool.
    let read = h
        .call("mcp_artifacts", json!({"action": "get", "rel": rel}))
        .await
        .unwrap();
    assert_eq!(read["result"]["bytes"], 1024);
    assert_eq!(read["result"]["content"].as_str().unwrap().len(), 1024);
}

#[tokio::test]
#[serial]
async fn context_detection_derives_gitops_tags() {
    let h = Harness::new(&[]);
    let repo = h.tmp.path().join("project");
    std::fs::create_dir_all(repo.join(".git")).unwrap();
    std::fs::create_dir_all(repo.join(".argocd")).unwrap();
    std::fs::create_dir_all(repo.join("flux-system")).unwrap();
    std::fs::write(repo.join("package.json"), "{}").unwrap();
    std::fs::write(repo.join("Dockerfile"), "FROM scratch").unwrap();

    let out = h
        .call(
            "mcp_context",
            json!({"action": "get", "cwd": repo.display().to_string()}),
        )
        .await
        .unwrap();
    let tags: Vec<String> = out["result"]["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    for expected in ["node", "docker", "git", "argocd", "flux", "gitops"] {
        assert!(tags.iter().any(|t| t == expected), "missing {expected} in {tags:?}");
    }
}

#[tokio::test]
#[serial]
async fn capability_routing_follows_context_tags() {
    let h = Harness::new(&[]);
    seed_runbook(&h, "rb.plan.argocd").await;
    seed_runbook(&h, "rb.plan.flux").await;
    for (name, tag, runbook) in [
        ("gitops.plan.argocd", "argocd", "rb.plan.argocd"),
        ("gitops.plan.flux", "flux", "rb.plan.flux"),
    ] {
        h.call(
            "mcp_capability",
            json!({"action": "set", "name": name, "capability": {
                "intent": "gitops.plan",
                "runbook": runbook,
                "inputs": {"pass_through": true},
                "effects": {"kind": "read", "requires_apply": false},
                "when": {"tags_any": [tag]},
            }}),
        )
        .await
        .unwrap();
    }

    let out = h
        .call(
            "mcp_intent",
            json!({"action": "compile", "type": "gitops.plan",
                   "context": flux_context(h.tmp.path())}),
        )
        .await
        .unwrap();
    let steps = out["result"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["runbook"], "rb.plan.flux");
}

#[tokio::test]
#[serial]
async fn audit_entries_redact_credentials() {
    let h = Harness::new(&[]);
    // The HTTP client is an external collaborator; the call fails, but the
    // envelope still audits the (redacted) input.
    let err = h
        .call(
            "mcp_api_client",
            json!({
                "action": "request",
                "headers": {"Authorization": "Bearer s3cret"},
                "auth_token": "s3cret",
                "body_base64": "QUJDREVGRw==",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, osp_error::ErrorCode::ExternalToolUnavailable);

    let out = h
        .call("mcp_audit", json!({"action": "read", "tool": "mcp_api_client"}))
        .await
        .unwrap();
    let entries = out["result"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let input = &entries[0]["input"];
    assert_eq!(input["headers"]["Authorization"], "[REDACTED]");
    assert_eq!(input["auth_token"], "[REDACTED]");
    assert!(input["body_base64"].as_str().unwrap().starts_with("[base64:"));

    let line = serde_json::to_string(&entries[0]).unwrap();
    assert!(!line.contains("s3cret"));
}

#[tokio::test]
#[serial]
async fn workspace_run_reports_trace_and_artifacts() {
    let h = Harness::new(&[]);
    seed_capability(&h, "gitops.status", "gitops.status", "rb.status", false).await;
    seed_runbook(&h, "rb.status").await;

    let out = h
        .call(
            "mcp_workspace",
            json!({"action": "run", "intent_type": "gitops.status",
                   "inputs": {"overlay": "envs/prod"}}),
        )
        .await
        .unwrap();
    assert_eq!(out["result"]["success"], true);
    assert!(out["result"]["trace_id"].is_string());
    assert!(out["result"]["artifact_uris"].is_array());
    // The runbook step ran and left its mark in session state.
    let state = h
        .call(
            "mcp_state",
            json!({"action": "get", "key": "ran.rb.status", "scope": "session"}),
        )
        .await
        .unwrap();
    assert_eq!(state["result"]["value"], "envs/prod");
}

#[tokio::test]
#[serial]
async fn nested_runbook_invocation_is_refused() {
    let h = Harness::new(&[]);
    let err = h
        .call(
            "mcp_runbook",
            json!({"action": "set", "name": "outer", "runbook": {
                "steps": [{"id": "inner", "tool": "mcp_runbook",
                            "args": {"action": "run", "name": "other"}}],
            }}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, osp_error::ErrorCode::RunbookNested);
}
