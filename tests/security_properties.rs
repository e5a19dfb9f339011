// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-crate security and boundary properties: secrets at rest, state
//! durability across restarts, sandbox containment, spill boundaries.

use osp_server::build_state;
use serde_json::{json, Value};
use serial_test::serial;

/// Stage a process env var. Tests are serialized, so the env is ours.
fn set_env(key: &str, value: impl AsRef<std::ffi::OsStr>) {
    unsafe { std::env::set_var(key, value) };
}

fn unset_env(key: &str) {
    unsafe { std::env::remove_var(key) };
}

struct Env {
    _tmp: tempfile::TempDir,
}

fn scoped_env(extra: &[(&str, String)]) -> Env {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("ctx")).unwrap();
    set_env("MCP_PROFILES_DIR", tmp.path().join("state"));
    set_env("SF_CONTEXT_REPO_ROOT", tmp.path().join("ctx"));
    for (key, value) in extra {
        set_env(key, value);
    }
    Env { _tmp: tmp }
}

impl Env {
    fn state_file(&self, name: &str) -> std::path::PathBuf {
        self._tmp.path().join("state").join(name)
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        for key in [
            "MCP_PROFILES_DIR",
            "SF_CONTEXT_REPO_ROOT",
            "SF_MAX_INLINE_BYTES",
            "SF_ALLOW_SECRET_EXPORT",
        ] {
            unset_env(key);
        }
    }
}

async fn call(
    state: &osp_server::AppState,
    tool: &str,
    args: Value,
) -> Result<Value, osp_error::ToolError> {
    state.executor.execute(tool, args).await.map(|e| e.result)
}

#[tokio::test]
#[serial]
async fn profile_secrets_never_touch_disk_in_plaintext() {
    let env = scoped_env(&[]);
    let state = build_state().unwrap();
    call(
        &state,
        "mcp_env",
        json!({"action": "profile_set", "name": "db", "type": "postgres",
               "data": {"host": "db.internal"},
               "secrets": {"password": "sup3r-s3cret-pw"}}),
    )
    .await
    .unwrap();

    let raw = std::fs::read_to_string(env.state_file("profiles.json")).unwrap();
    assert!(!raw.contains("sup3r-s3cret-pw"));
    assert!(raw.contains("password"));

    // Listing never exposes secret values.
    let listed = call(&state, "mcp_env", json!({"action": "profile_list"})).await.unwrap();
    assert!(!serde_json::to_string(&listed).unwrap().contains("sup3r-s3cret-pw"));

    // Revealing decrypted secrets is gated behind the export flag.
    let err = call(
        &state,
        "mcp_env",
        json!({"action": "profile_get", "name": "db", "reveal": true}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, osp_error::ErrorCode::SecretExportDisabled);

    set_env("SF_ALLOW_SECRET_EXPORT", "1");
    let revealed = call(
        &state,
        "mcp_env",
        json!({"action": "profile_get", "name": "db", "reveal": true}),
    )
    .await
    .unwrap();
    assert_eq!(revealed["secrets"]["password"], "sup3r-s3cret-pw");
    unset_env("SF_ALLOW_SECRET_EXPORT");
}

#[tokio::test]
#[serial]
async fn persistent_state_survives_restart_session_does_not() {
    let _env = scoped_env(&[]);
    {
        let state = build_state().unwrap();
        call(
            &state,
            "mcp_state",
            json!({"action": "set", "key": "durable", "value": 42, "scope": "persistent"}),
        )
        .await
        .unwrap();
        call(
            &state,
            "mcp_state",
            json!({"action": "set", "key": "ephemeral", "value": 1, "scope": "session"}),
        )
        .await
        .unwrap();
    }

    // A fresh wiring over the same base dir sees only the persistent scope.
    let state = build_state().unwrap();
    let durable = call(&state, "mcp_state", json!({"action": "get", "key": "durable"}))
        .await
        .unwrap();
    assert_eq!(durable["value"], 42);
    let ephemeral = call(&state, "mcp_state", json!({"action": "get", "key": "ephemeral"}))
        .await
        .unwrap();
    assert_eq!(ephemeral["found"], false);
}

#[tokio::test]
#[serial]
async fn artifact_reads_cannot_escape_the_sandbox() {
    let env = scoped_env(&[]);
    let state = build_state().unwrap();
    // Plant a file outside the artifacts root.
    std::fs::write(env._tmp.path().join("outside.txt"), "secret").unwrap();

    for path in [
        "../outside.txt",
        "/etc/passwd",
        "runs/../../outside.txt",
        "artifact://../outside.txt",
    ] {
        let err = call(&state, "mcp_artifacts", json!({"action": "get", "rel": path}))
            .await
            .unwrap_err();
        assert_eq!(err.code, osp_error::ErrorCode::BadUri, "path {path:?}");
    }
}

#[tokio::test]
#[serial]
async fn spill_boundary_is_exact() {
    let _env = scoped_env(&[("SF_MAX_INLINE_BYTES", "64".to_string())]);
    let state = build_state().unwrap();

    let exact = "x".repeat(64);
    call(
        &state,
        "mcp_state",
        json!({"action": "set", "key": "exact", "value": exact, "scope": "session"}),
    )
    .await
    .unwrap();
    let got = call(&state, "mcp_state", json!({"action": "get", "key": "exact"}))
        .await
        .unwrap();
    assert_eq!(got["value"].as_str().unwrap().len(), 64);

    let over = "x".repeat(65);
    call(
        &state,
        "mcp_state",
        json!({"action": "set", "key": "over", "value": over, "scope": "session"}),
    )
    .await
    .unwrap();
    let got = call(&state, "mcp_state", json!({"action": "get", "key": "over"}))
        .await
        .unwrap();
    assert_eq!(got["value"]["truncated"], true);
    assert_eq!(got["value"]["bytes"], 65);
    assert!(got["value"]["artifact"].is_object());
}

#[tokio::test]
#[serial]
async fn self_dependent_capability_is_a_cycle() {
    let _env = scoped_env(&[]);
    let state = build_state().unwrap();
    let err = call(
        &state,
        "mcp_capability",
        json!({"action": "set", "name": "loopy", "capability": {
            "intent": "x", "runbook": "rb",
            "effects": {"kind": "read", "requires_apply": false},
            "depends_on": ["loopy"],
        }}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, osp_error::ErrorCode::CapabilityDepCycle);
}

#[tokio::test]
#[serial]
async fn advisory_lock_blocks_concurrent_gitops_writes() {
    let _env = scoped_env(&[]);
    let state = build_state().unwrap();

    // Project with a locked target and a write capability.
    call(
        &state,
        "mcp_state",
        json!({"action": "set", "key": "policy.lock.shop.prod",
               "value": {"holder": "someone-else",
                          "expires_at": "2099-01-01T00:00:00Z"},
               "scope": "persistent"}),
    )
    .await
    .unwrap();

    let projects_path = {
        // projects.json sits next to the other state files.
        std::env::var("MCP_PROFILES_DIR").unwrap() + "/projects.json"
    };
    std::fs::write(
        &projects_path,
        serde_json::to_string_pretty(&json!({
            "shop": {"default_target": "prod", "targets": {"prod": {}}}
        }))
        .unwrap(),
    )
    .unwrap();

    // Rebuild so the registry picks up the project file.
    let state = build_state().unwrap();
    call(
        &state,
        "mcp_capability",
        json!({"action": "set", "name": "gitops.sync", "capability": {
            "intent": "gitops.sync", "runbook": "rb.sync",
            "inputs": {"pass_through": true},
            "effects": {"kind": "write", "requires_apply": true},
        }}),
    )
    .await
    .unwrap();
    call(
        &state,
        "mcp_runbook",
        json!({"action": "set", "name": "rb.sync", "runbook": {
            "steps": [{"id": "noop", "tool": "mcp_state",
                        "args": {"action": "list"}}],
        }}),
    )
    .await
    .unwrap();

    let err = call(
        &state,
        "mcp_intent",
        json!({"action": "execute", "type": "gitops.sync", "apply": true,
               "project": "shop", "target": "prod", "skip_plan_check": true}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, osp_error::ErrorCode::PolicyLockHeld);
}
