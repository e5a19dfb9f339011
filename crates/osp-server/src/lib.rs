// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-server
#![deny(unsafe_code)]

pub mod dispatch;
pub mod handlers;

use anyhow::{Context, Result};
use osp_artifact::ArtifactStore;
use osp_capability::CapabilityRegistry;
use osp_context::ContextDetector;
use osp_executor::ToolExecutor;
use osp_intent::IntentPlanner;
use osp_paths::{Budgets, RunnerBudgets, StatePaths};
use osp_runbook::{Runbook, RunbookEngine, ToolInvoker};
use osp_runner::SafeRunner;
use osp_secure::{NoVault, SecretKey};
use osp_store::{AuditLog, JobStore, NamedStore, ProfileStore, Project, StateStore};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Everything the dispatcher needs, wired once at startup.
pub struct AppState {
    /// Resolved state-file locations.
    pub paths: StatePaths,
    /// The execution envelope fronting every tool.
    pub executor: Arc<ToolExecutor>,
    /// Background-job registry (flushed at teardown).
    pub jobs: Arc<JobStore>,
}

/// Build the full application state from the environment.
///
/// Initialization order matters: paths first, then the security key, then
/// the stores, then detection and registries, then the engine/planner pair,
/// and the executor last so handlers can be registered against it.
///
/// # Errors
///
/// Fails when a state file is unreadable or the security key cannot be
/// loaded or created.
pub fn build_state() -> Result<AppState> {
    let paths = StatePaths::from_env();
    paths.ensure_dirs().context("create state directories")?;

    let key = SecretKey::load(&paths.profile_key).context("load process key")?;
    let vault = Arc::new(NoVault);

    let profiles = Arc::new(
        ProfileStore::open(&paths.profiles, key, vault).context("open profile store")?,
    );
    let state = Arc::new(StateStore::open(&paths.state).context("open state store")?);
    let audit = Arc::new(AuditLog::open(&paths.audit));
    let jobs = Arc::new(
        JobStore::file_backed(
            &paths.jobs,
            osp_store::jobs::DEFAULT_MAX_JOBS,
            osp_store::jobs::DEFAULT_TTL_MS,
        )
        .context("open job store")?,
    );
    jobs.spawn_flusher();

    let projects: Arc<NamedStore<Project>> =
        Arc::new(NamedStore::open(&paths.projects).context("open project registry")?);
    let runbooks: Arc<NamedStore<Runbook>> =
        Arc::new(NamedStore::open(&paths.runbooks).context("open runbook registry")?);
    let aliases: Arc<NamedStore<Value>> =
        Arc::new(NamedStore::open(&paths.aliases).context("open alias store")?);
    let presets: Arc<NamedStore<Value>> =
        Arc::new(NamedStore::open(&paths.presets).context("open preset store")?);
    let capabilities = Arc::new(
        CapabilityRegistry::open(&paths.capabilities).context("open capability registry")?,
    );
    let detector = Arc::new(
        ContextDetector::open(&paths.context, Some(Arc::clone(&projects)))
            .context("open context detector")?,
    );

    let artifacts = ArtifactStore::from_env();
    let budgets = Budgets::from_env();

    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&aliases),
        Arc::clone(&presets),
        Arc::clone(&state),
        Arc::clone(&audit),
        artifacts.clone(),
        budgets,
    ));

    let engine = Arc::new(RunbookEngine::new(
        Arc::clone(&executor) as Arc<dyn ToolInvoker>,
        Arc::clone(&state),
    ));

    let planner = Arc::new(IntentPlanner::new(
        Arc::clone(&capabilities),
        Arc::clone(&runbooks),
        Arc::clone(&detector),
        Arc::clone(&engine),
        Arc::clone(&state),
        artifacts.clone(),
        Arc::clone(&projects),
        paths.evidence_dir.clone(),
    ));

    // The runner is confined to the context root when one is configured,
    // falling back to the process cwd.
    let repo_root = std::env::var_os(osp_artifact::ENV_CONTEXT_ROOT)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| ".".into()));
    let runner = SafeRunner::new(
        repo_root,
        artifacts.clone(),
        RunnerBudgets::from_env(),
        budgets.tool_call_timeout_ms,
    )
    .context("build safe runner")?
    .with_jobs(Arc::clone(&jobs));

    handlers::register_all(
        &executor,
        handlers::HandlerDeps {
            detector,
            artifacts,
            runner,
            state,
            profiles,
            runbooks,
            engine,
            aliases,
            presets,
            audit,
            capabilities,
            planner,
            jobs: Arc::clone(&jobs),
        },
    );

    info!(
        target: "osp.server",
        base_dir = %paths.base_dir.display(),
        "control plane initialized"
    );

    Ok(AppState {
        paths,
        executor,
        jobs,
    })
}

impl AppState {
    /// Flush debounced writes before exit.
    pub fn teardown(&self) {
        if let Err(err) = self.jobs.flush() {
            tracing::warn!(target: "osp.server", %err, "job store flush failed at teardown");
        }
    }
}
