// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-intent
#![deny(unsafe_code)]

use chrono::Utc;
use osp_artifact::ArtifactStore;
use osp_capability::{CapabilityRegistry, EffectKind, Effects};
use osp_context::{ContextDetector, ContextQuery, ContextRecord};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_policy::{check_plan_evidence, PolicyConfig, PolicyGuard};
use osp_runbook::{Runbook, RunbookEngine, RunbookOutcome, TraceContext};
use osp_secure::redact::redact_value;
use osp_store::{NamedStore, Project, StateStore};
use osp_template::lookup_path;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Request / plan shapes
// ---------------------------------------------------------------------------

/// A typed request from the agent. Constructed per call, never stored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Intent {
    /// Intent type, e.g. `gitops.plan`.
    #[serde(rename = "type")]
    pub intent_type: String,
    /// Free-form inputs handed to capabilities.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Write-gate consent.
    #[serde(default)]
    pub apply: bool,
    /// Project name for registry resolution.
    #[serde(default)]
    pub project: Option<String>,
    /// Target name within the project.
    #[serde(default)]
    pub target: Option<String>,
    /// Caller-supplied context; otherwise detected.
    #[serde(default)]
    pub context: Option<ContextRecord>,
}

/// One step of a compiled plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Capability the step came from.
    pub capability: String,
    /// Runbook the step executes.
    pub runbook: String,
    /// Resolved inputs (defaults ← mapped ← pass-through, apply injected).
    pub inputs: Value,
    /// Declared effects of the capability.
    pub effects: Effects,
    /// Required inputs still unresolved.
    pub missing: Vec<String>,
}

/// A compiled plan: topologically-ordered steps plus aggregated effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Redacted snapshot of the intent.
    pub intent: Value,
    /// Steps in dependency order (leaves first).
    pub steps: Vec<PlanStep>,
    /// Effects aggregated across all steps.
    pub effects: Effects,
    /// Union of unresolved required inputs.
    pub missing: Vec<String>,
}

/// Per-step execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Capability executed.
    pub capability: String,
    /// Runbook outcome.
    pub outcome: RunbookOutcome,
}

/// Result of `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Whether every executed step succeeded.
    pub success: bool,
    /// The compiled plan.
    pub plan: Plan,
    /// Step outcomes in execution order.
    pub steps: Vec<StepExecution>,
    /// Where the evidence bundle landed, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
}

/// Execution options beyond the intent itself.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteOptions {
    /// Halt the plan at the first failing step (default true).
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    /// Persist an evidence bundle after the run.
    #[serde(default)]
    pub save_evidence: bool,
    /// Override the diff-before-apply evidence check.
    #[serde(default)]
    pub skip_plan_check: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            save_evidence: false,
            skip_plan_check: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Compiles and executes intents.
pub struct IntentPlanner {
    capabilities: Arc<CapabilityRegistry>,
    runbooks: Arc<NamedStore<Runbook>>,
    detector: Arc<ContextDetector>,
    engine: Arc<RunbookEngine>,
    state: Arc<StateStore>,
    artifacts: ArtifactStore,
    projects: Arc<NamedStore<Project>>,
    evidence_dir: PathBuf,
}

impl std::fmt::Debug for IntentPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentPlanner")
            .field("evidence_dir", &self.evidence_dir)
            .finish()
    }
}

impl IntentPlanner {
    /// Wire a planner over its collaborating stores.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        runbooks: Arc<NamedStore<Runbook>>,
        detector: Arc<ContextDetector>,
        engine: Arc<RunbookEngine>,
        state: Arc<StateStore>,
        artifacts: ArtifactStore,
        projects: Arc<NamedStore<Project>>,
        evidence_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            capabilities,
            runbooks,
            detector,
            engine,
            state,
            artifacts,
            projects,
            evidence_dir: evidence_dir.into(),
        }
    }

    /// Compile an intent into a plan without executing anything.
    ///
    /// # Errors
    ///
    /// `CAPABILITY_NOT_FOUND`, `CAPABILITY_NOT_MATCHED`,
    /// `CAPABILITY_DEP_CYCLE`.
    pub fn compile(&self, intent: &Intent) -> ToolResult<Plan> {
        let context = self.attach_context(intent);
        let root = self.select_capability(intent, context.as_ref())?;
        let ordered = self.capabilities.expand_postorder(&root)?;

        let inputs_value = Value::Object(intent.inputs.clone());
        let mut steps = Vec::with_capacity(ordered.len());
        for cap in &ordered {
            let mut resolved = Map::new();
            for (key, value) in &cap.inputs.defaults {
                resolved.insert(key.clone(), value.clone());
            }
            for (target_key, source_path) in &cap.inputs.map {
                if let Some(value) = lookup_path(&inputs_value, source_path) {
                    resolved.insert(target_key.clone(), value);
                }
            }
            if cap.inputs.pass_through {
                for (key, value) in &intent.inputs {
                    resolved.insert(key.clone(), value.clone());
                }
            }
            resolved.insert("apply".into(), json!(intent.apply));
            if let Some(ctx) = &context {
                resolved
                    .entry("context".to_string())
                    .or_insert_with(|| json!(ctx));
            }

            let missing: Vec<String> = cap
                .inputs
                .required
                .iter()
                .filter(|key| resolved.get(*key).map(Value::is_null).unwrap_or(true))
                .cloned()
                .collect();

            steps.push(PlanStep {
                capability: cap.name.clone(),
                runbook: cap.runbook.clone(),
                inputs: Value::Object(resolved),
                effects: cap.effects,
                missing,
            });
        }

        let effects = Effects::aggregate(steps.iter().map(|s| &s.effects));
        let mut missing: Vec<String> = steps.iter().flat_map(|s| s.missing.clone()).collect();
        missing.sort();
        missing.dedup();

        debug!(
            target: "osp.intent",
            intent = %intent.intent_type,
            capability = %root,
            steps = steps.len(),
            ?effects,
            "compiled plan"
        );

        Ok(Plan {
            intent: redact_value(&json!({
                "type": intent.intent_type,
                "inputs": intent.inputs,
                "apply": intent.apply,
                "project": intent.project,
                "target": intent.target,
            })),
            steps,
            effects,
            missing,
        })
    }

    /// Compile and return the plan with fully redacted step inputs.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`compile`](Self::compile).
    pub fn dry_run(&self, intent: &Intent) -> ToolResult<Plan> {
        let mut plan = self.compile(intent)?;
        for step in &mut plan.steps {
            step.inputs = redact_value(&step.inputs);
        }
        Ok(plan)
    }

    /// Compile and execute an intent.
    ///
    /// Enforces the write gate, acquires the policy guard for GitOps write
    /// intents, runs each step's runbook, and optionally persists evidence.
    ///
    /// # Errors
    ///
    /// Compilation errors, `APPLY_REQUIRED`, `MISSING_INPUTS`, policy
    /// denials, and `RUNBOOK_NOT_FOUND`.
    pub async fn execute(
        &self,
        intent: &Intent,
        options: &ExecuteOptions,
        trace: &TraceContext,
    ) -> ToolResult<ExecutionReport> {
        let plan = self.compile(intent)?;

        if plan.effects.requires_apply && !intent.apply {
            return Err(ToolError::new(
                ErrorCode::ApplyRequired,
                format!(
                    "intent '{}' has {:?} effects and requires apply: true",
                    intent.intent_type, plan.effects.kind
                ),
            )
            .with_hint("review the dry run, then re-run with apply: true"));
        }
        if !plan.missing.is_empty() {
            return Err(ToolError::new(
                ErrorCode::MissingInputs,
                format!("missing required inputs: {}", plan.missing.join(", ")),
            )
            .with_details(json!({"missing": plan.missing})));
        }

        // The guard lives for the whole execution; Drop releases the lock
        // on every exit path, including early errors below.
        let _guard = self.policy_gate(intent, &plan, options, trace)?;

        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut success = true;
        for step in &plan.steps {
            let runbook = self.runbooks.get(&step.runbook).ok_or_else(|| {
                ToolError::new(
                    ErrorCode::RunbookNotFound,
                    format!("runbook '{}' not found", step.runbook),
                )
            })?;
            info!(
                target: "osp.intent",
                capability = %step.capability,
                runbook = %step.runbook,
                "executing plan step"
            );
            let outcome = self
                .engine
                .run(&runbook, step.inputs.clone(), &trace.child())
                .await?;
            let failed = !outcome.success;
            steps.push(StepExecution {
                capability: step.capability.clone(),
                outcome,
            });
            if failed {
                warn!(target: "osp.intent", capability = %step.capability, "plan step failed");
                success = false;
                if options.stop_on_error {
                    break;
                }
            }
        }

        let evidence_path = if options.save_evidence {
            self.save_evidence(&plan, &steps, success, trace)?
        } else {
            None
        };

        Ok(ExecutionReport {
            success,
            plan,
            steps,
            evidence_path,
        })
    }

    // -- Capability selection -------------------------------------------

    fn attach_context(&self, intent: &Intent) -> Option<ContextRecord> {
        if let Some(ctx) = &intent.context {
            return Some(ctx.clone());
        }
        let query = ContextQuery {
            project: intent.project.clone(),
            target: intent.target.clone(),
            ..ContextQuery::default()
        };
        match self.detector.get(&query) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(target: "osp.intent", %err, "context detection failed; continuing without");
                None
            }
        }
    }

    fn select_capability(
        &self,
        intent: &Intent,
        context: Option<&ContextRecord>,
    ) -> ToolResult<String> {
        let candidates = self.capabilities.list_for_intent(&intent.intent_type);
        if candidates.is_empty() {
            return Err(ToolError::new(
                ErrorCode::CapabilityNotFound,
                format!("no capability serves intent '{}'", intent.intent_type),
            ));
        }

        // Absence of `when` matches everything; a `when` with no resolvable
        // context fails closed.
        let matched: Vec<_> = candidates
            .into_iter()
            .filter(|cap| match (&cap.when, context) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(pred), Some(ctx)) => pred.matches(&ctx.tags),
            })
            .collect();

        if matched.is_empty() {
            return Err(ToolError::new(
                ErrorCode::CapabilityNotMatched,
                format!(
                    "no capability for intent '{}' matches the current context",
                    intent.intent_type
                ),
            )
            .with_hint("check the detected tags with mcp_context, or pass an explicit context"));
        }

        // Direct name hit wins; otherwise lexicographic order (already
        // sorted by the registry).
        let chosen = matched
            .iter()
            .find(|cap| cap.name == intent.intent_type)
            .unwrap_or(&matched[0]);
        Ok(chosen.name.clone())
    }

    // -- Policy ----------------------------------------------------------

    fn policy_gate(
        &self,
        intent: &Intent,
        plan: &Plan,
        options: &ExecuteOptions,
        trace: &TraceContext,
    ) -> ToolResult<Option<PolicyGuard>> {
        let is_gitops_write = intent.intent_type.starts_with("gitops.")
            && matches!(plan.effects.kind, EffectKind::Write | EffectKind::Mixed);
        if !is_gitops_write {
            return Ok(None);
        }

        // Without a registry target there is no policy block to consult;
        // the write gate itself (apply) has already been enforced.
        let Some(project) = intent.project.as_deref() else {
            return Ok(None);
        };
        let project_record = self.projects.get(project);
        let Some(target) = intent.target.clone().or_else(|| {
            project_record
                .as_ref()
                .and_then(|p| p.default_target.clone())
        }) else {
            return Ok(None);
        };

        let policy_value = project_record
            .as_ref()
            .and_then(|p| p.targets.get(&target).and_then(|t| t.policy.clone()));
        let config = PolicyConfig::from_value(policy_value.as_ref())?;

        config.check_window(Utc::now())?;
        if let Some(remote) = intent
            .inputs
            .get("remote_url")
            .or_else(|| intent.inputs.get("remote"))
            .and_then(Value::as_str)
        {
            config.check_remote(remote)?;
        }
        if matches!(intent.intent_type.as_str(), "gitops.sync" | "gitops.rollback") {
            check_plan_evidence(&self.artifacts, &trace.trace_id, options.skip_plan_check)?;
        }

        let guard = PolicyGuard::acquire(
            Arc::clone(&self.state),
            &config,
            project,
            &target,
            &trace.trace_id,
        )?;
        Ok(Some(guard))
    }

    // -- Evidence --------------------------------------------------------

    fn save_evidence(
        &self,
        plan: &Plan,
        steps: &[StepExecution],
        success: bool,
        trace: &TraceContext,
    ) -> ToolResult<Option<String>> {
        let bundle = json!({
            "intent": plan.intent,
            "effects": plan.effects,
            "dry_run": false,
            "executed_at": Utc::now(),
            "steps": steps,
            "success": success,
        });
        let path = self
            .evidence_dir
            .join(format!("evidence-{}-{}.json", trace.trace_id, trace.span_id));
        osp_paths::atomic_write(&path, &serde_json::to_vec_pretty(&bundle)?)
            .map_err(|e| ToolError::internal(format!("write evidence bundle: {e}")))?;
        Ok(Some(path.display().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use osp_capability::{Capability, CapabilityInputs, TagPredicate};
    use osp_runbook::{Invocation, Step, ToolInvoker};
    use std::sync::Mutex;

    struct EchoInvoker {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        async fn invoke(
            &self,
            tool: &str,
            args: Value,
            _trace: &TraceContext,
        ) -> ToolResult<Invocation> {
            self.calls.lock().unwrap().push((tool.to_string(), args.clone()));
            if tool == "failing" {
                return Err(ToolError::internal("boom"));
            }
            Ok(Invocation {
                result: json!({"ok": true}),
                meta: json!({"tool": tool}),
            })
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        planner: IntentPlanner,
        invoker: Arc<EchoInvoker>,
        capabilities: Arc<CapabilityRegistry>,
        runbooks: Arc<NamedStore<Runbook>>,
        repo: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let capabilities =
            Arc::new(CapabilityRegistry::open(tmp.path().join("capabilities.json")).unwrap());
        let runbooks: Arc<NamedStore<Runbook>> =
            Arc::new(NamedStore::open(tmp.path().join("runbooks.json")).unwrap());
        let projects: Arc<NamedStore<Project>> =
            Arc::new(NamedStore::open(tmp.path().join("projects.json")).unwrap());
        let detector = Arc::new(
            ContextDetector::open(tmp.path().join("context.json"), Some(Arc::clone(&projects)))
                .unwrap(),
        );
        let state = Arc::new(StateStore::open(tmp.path().join("state.json")).unwrap());
        let invoker = Arc::new(EchoInvoker {
            calls: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(RunbookEngine::new(
            Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
            Arc::clone(&state),
        ));
        let artifacts = ArtifactStore::rooted_at(tmp.path().join("ctx"));
        let planner = IntentPlanner::new(
            Arc::clone(&capabilities),
            Arc::clone(&runbooks),
            detector,
            engine,
            state,
            artifacts,
            projects,
            tmp.path().join("evidence"),
        );
        Fixture {
            _tmp: tmp,
            planner,
            invoker,
            capabilities,
            runbooks,
            repo,
        }
    }

    fn simple_runbook(tool: &str) -> Runbook {
        Runbook {
            name: None,
            steps: vec![Step {
                id: "only".into(),
                tool: tool.into(),
                args: json!({"overlay": "{{ ?input.overlay }}"}),
                when: None,
                foreach: None,
                retry: None,
                continue_on_error: false,
            }],
            template_missing: None,
        }
    }

    fn cap(intent: &str, runbook: &str, effects: Effects) -> Capability {
        Capability {
            name: String::new(),
            intent: intent.into(),
            runbook: runbook.into(),
            inputs: CapabilityInputs {
                pass_through: true,
                ..CapabilityInputs::default()
            },
            effects,
            depends_on: Vec::new(),
            when: None,
            tags: Vec::new(),
        }
    }

    fn write_effects() -> Effects {
        Effects {
            kind: EffectKind::Write,
            requires_apply: true,
        }
    }

    fn intent(intent_type: &str, inputs: Value, apply: bool) -> Intent {
        Intent {
            intent_type: intent_type.into(),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            apply,
            project: None,
            target: None,
            context: None,
        }
    }

    fn flux_context(repo: &std::path::Path) -> ContextRecord {
        ContextRecord {
            key: "cwd:test".into(),
            root: repo.display().to_string(),
            cwd: repo.display().to_string(),
            git_root: None,
            tags: vec!["flux".into(), "gitops".into()],
            signals: Default::default(),
            files: Default::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn apply_gate_denies_write_without_apply() {
        let fx = fixture();
        fx.capabilities
            .set("k8s.apply", cap("k8s.apply", "rb.apply", write_effects()))
            .unwrap();
        fx.runbooks.set("rb.apply", simple_runbook("echo")).unwrap();

        let err = fx
            .planner
            .execute(
                &intent("k8s.apply", json!({"overlay": "/repo/o"}), false),
                &ExecuteOptions::default(),
                &TraceContext::root(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, osp_error::ErrorKind::Denied);
        assert_eq!(err.code, ErrorCode::ApplyRequired);
        assert!(fx.invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_true_executes_and_saves_evidence() {
        let fx = fixture();
        fx.capabilities
            .set("k8s.apply", cap("k8s.apply", "rb.apply", write_effects()))
            .unwrap();
        fx.runbooks.set("rb.apply", simple_runbook("echo")).unwrap();

        let report = fx
            .planner
            .execute(
                &intent("k8s.apply", json!({"overlay": "/repo/o"}), true),
                &ExecuteOptions {
                    save_evidence: true,
                    ..ExecuteOptions::default()
                },
                &TraceContext::root(),
            )
            .await
            .unwrap();
        assert!(report.success);
        let evidence = report.evidence_path.expect("evidence written");
        let raw = std::fs::read_to_string(evidence).unwrap();
        assert!(raw.contains("\"success\": true"));
        assert_eq!(fx.invoker.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn routing_prefers_matching_when_predicate() {
        let fx = fixture();
        let mut argo = cap("gitops.plan", "rb.argocd", Effects::read());
        argo.when = Some(TagPredicate::TagsAny(vec!["argocd".into()]));
        let mut flux = cap("gitops.plan", "rb.flux", Effects::read());
        flux.when = Some(TagPredicate::TagsAny(vec!["flux".into()]));
        fx.capabilities.set("gitops.plan.argocd", argo).unwrap();
        fx.capabilities.set("gitops.plan.flux", flux).unwrap();

        let mut request = intent("gitops.plan", json!({}), false);
        request.context = Some(flux_context(&fx.repo));
        let plan = fx.planner.compile(&request).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].runbook, "rb.flux");
    }

    #[tokio::test]
    async fn when_without_context_fails_closed() {
        let fx = fixture();
        let mut gated = cap("gitops.plan", "rb.flux", Effects::read());
        gated.when = Some(TagPredicate::TagsAny(vec!["flux".into()]));
        fx.capabilities.set("gitops.plan.flux", gated).unwrap();

        // Detection runs against a plain temp dir: no flux tag, no match.
        let err = fx
            .planner
            .compile(&intent("gitops.plan", json!({}), false))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotMatched);
    }

    #[tokio::test]
    async fn unknown_intent_is_not_found() {
        let fx = fixture();
        let err = fx
            .planner
            .compile(&intent("gitops.unknown", json!({}), false))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[tokio::test]
    async fn dependencies_expand_in_topological_order() {
        let fx = fixture();
        fx.capabilities
            .set("render", cap("internal.render", "rb.render", Effects::read()))
            .unwrap();
        let mut diff = cap("internal.diff", "rb.diff", Effects::read());
        diff.depends_on = vec!["render".into()];
        fx.capabilities.set("diff", diff).unwrap();
        let mut plan_cap = cap("gitops.plan", "rb.plan", Effects::read());
        plan_cap.depends_on = vec!["diff".into()];
        fx.capabilities.set("gitops.plan", plan_cap).unwrap();

        let plan = fx
            .planner
            .compile(&intent("gitops.plan", json!({}), false))
            .unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.capability.as_str()).collect();
        assert_eq!(order, vec!["render", "diff", "gitops.plan"]);
    }

    #[tokio::test]
    async fn input_mapping_defaults_and_missing() {
        let fx = fixture();
        let mut c = cap("deploy", "rb.deploy", Effects::read());
        c.inputs = CapabilityInputs {
            required: vec!["overlay".into(), "cluster".into()],
            defaults: [("region".to_string(), json!("eu-1"))].into_iter().collect(),
            map: [("overlay".to_string(), "paths.overlay".to_string())]
                .into_iter()
                .collect(),
            pass_through: false,
        };
        fx.capabilities.set("deploy", c).unwrap();

        let plan = fx
            .planner
            .compile(&intent(
                "deploy",
                json!({"paths": {"overlay": "envs/prod"}, "junk": 1}),
                false,
            ))
            .unwrap();
        let step = &plan.steps[0];
        assert_eq!(step.inputs["overlay"], "envs/prod");
        assert_eq!(step.inputs["region"], "eu-1");
        assert_eq!(step.inputs["apply"], false);
        // pass_through is off: junk does not leak through.
        assert!(step.inputs.get("junk").is_none());
        assert_eq!(plan.missing, vec!["cluster".to_string()]);

        // Executing with missing inputs is refused.
        let err = fx
            .planner
            .execute(
                &intent("deploy", json!({"paths": {"overlay": "envs/prod"}}), false),
                &ExecuteOptions::default(),
                &TraceContext::root(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingInputs);
    }

    #[tokio::test]
    async fn effects_aggregate_across_steps() {
        let fx = fixture();
        fx.capabilities
            .set("read1", cap("internal.read", "rb.r", Effects::read()))
            .unwrap();
        let mut root = cap("gitops.sync", "rb.sync", write_effects());
        root.depends_on = vec!["read1".into()];
        fx.capabilities.set("gitops.sync", root).unwrap();

        let plan = fx
            .planner
            .compile(&intent("gitops.sync", json!({}), false))
            .unwrap();
        assert_eq!(plan.effects.kind, EffectKind::Write);
        assert!(plan.effects.requires_apply);
    }

    #[tokio::test]
    async fn stop_on_error_halts_the_plan() {
        let fx = fixture();
        fx.capabilities
            .set("bad", cap("internal.bad", "rb.bad", Effects::read()))
            .unwrap();
        let mut root = cap("pipeline", "rb.good", Effects::read());
        root.depends_on = vec!["bad".into()];
        fx.capabilities.set("pipeline", root).unwrap();
        fx.runbooks.set("rb.bad", simple_runbook("failing")).unwrap();
        fx.runbooks.set("rb.good", simple_runbook("echo")).unwrap();

        let report = fx
            .planner
            .execute(
                &intent("pipeline", json!({}), false),
                &ExecuteOptions::default(),
                &TraceContext::root(),
            )
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.steps.len(), 1);
        let calls = fx.invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "failing");
    }

    #[tokio::test]
    async fn plan_intent_snapshot_is_redacted() {
        let fx = fixture();
        fx.capabilities
            .set("deploy", cap("deploy", "rb.deploy", Effects::read()))
            .unwrap();
        let plan = fx
            .planner
            .compile(&intent("deploy", json!({"auth_token": "s3cret"}), false))
            .unwrap();
        assert_eq!(plan.intent["inputs"]["auth_token"], "[REDACTED]");
        assert!(!serde_json::to_string(&plan.intent).unwrap().contains("s3cret"));
    }
}
