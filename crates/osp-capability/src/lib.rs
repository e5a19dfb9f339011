// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-capability
#![deny(unsafe_code)]

use osp_error::{ErrorCode, ToolError, ToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Effect classification of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Observes only.
    Read,
    /// Mutates the target system.
    Write,
    /// Both reads and writes.
    Mixed,
}

/// Declared effects of a capability or aggregated plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Effects {
    /// Effect classification.
    pub kind: EffectKind,
    /// Whether execution demands `apply: true`.
    pub requires_apply: bool,
}

impl Effects {
    /// Read-only effects.
    #[must_use]
    pub fn read() -> Self {
        Self {
            kind: EffectKind::Read,
            requires_apply: false,
        }
    }

    /// Aggregate effects across plan steps: `mixed` dominates `write`
    /// dominates `read`; `requires_apply` if any step requires it.
    #[must_use]
    pub fn aggregate<'a>(steps: impl IntoIterator<Item = &'a Effects>) -> Self {
        let mut kind = EffectKind::Read;
        let mut requires_apply = false;
        for step in steps {
            kind = kind.max(step.kind);
            requires_apply |= step.requires_apply;
        }
        Self {
            kind,
            requires_apply,
        }
    }
}

/// Input resolution metadata for a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityInputs {
    /// Inputs that must be non-null after resolution.
    #[serde(default)]
    pub required: Vec<String>,
    /// Default values applied first.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Remapping `target ← path-lookup(intent.inputs, source)`.
    #[serde(default)]
    pub map: BTreeMap<String, String>,
    /// Whether unmapped intent inputs pass through.
    #[serde(default)]
    pub pass_through: bool,
}

/// Boolean predicate over context tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TagPredicate {
    /// At least one listed tag present.
    TagsAny(Vec<String>),
    /// Every listed tag present.
    TagsAll(Vec<String>),
    /// No listed tag present.
    TagsNone(Vec<String>),
    /// All sub-predicates hold.
    And(Vec<TagPredicate>),
    /// At least one sub-predicate holds.
    Or(Vec<TagPredicate>),
    /// The sub-predicate does not hold.
    Not(Box<TagPredicate>),
}

impl TagPredicate {
    /// Evaluate against a tag set.
    #[must_use]
    pub fn matches(&self, tags: &[String]) -> bool {
        let has = |t: &String| tags.contains(t);
        match self {
            Self::TagsAny(list) => list.iter().any(has),
            Self::TagsAll(list) => list.iter().all(has),
            Self::TagsNone(list) => !list.iter().any(has),
            Self::And(preds) => preds.iter().all(|p| p.matches(tags)),
            Self::Or(preds) => preds.iter().any(|p| p.matches(tags)),
            Self::Not(pred) => !pred.matches(tags),
        }
    }
}

/// One capability record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capability {
    /// Unique name; filled from the registry key on load.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Intent type this capability serves.
    pub intent: String,
    /// Runbook executed for this capability.
    pub runbook: String,
    /// Input resolution metadata.
    #[serde(default)]
    pub inputs: CapabilityInputs,
    /// Declared effects.
    pub effects: Effects,
    /// Capabilities that must run before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Context predicate; absence matches every context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<TagPredicate>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// File-backed capability registry (`capabilities.json`).
pub struct CapabilityRegistry {
    path: PathBuf,
    caps: Mutex<BTreeMap<String, Capability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("path", &self.path)
            .finish()
    }
}

impl CapabilityRegistry {
    /// Open the registry, loading and validating any existing file.
    ///
    /// # Errors
    ///
    /// Fails on parse errors, invalid records, or dependency cycles.
    pub fn open(path: impl Into<PathBuf>) -> ToolResult<Self> {
        let path = path.into();
        let mut caps: BTreeMap<String, Capability> = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .map_err(|e| ToolError::internal(format!("parse {}: {e}", path.display())))?,
            _ => BTreeMap::new(),
        };
        for (name, cap) in &mut caps {
            cap.name = name.clone();
            validate_record(cap)?;
        }
        let registry = Self {
            path,
            caps: Mutex::new(caps),
        };
        registry.check_acyclic()?;
        Ok(registry)
    }

    /// Look up a capability by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Capability> {
        self.caps
            .lock()
            .expect("capability lock poisoned")
            .get(name)
            .cloned()
    }

    /// All capabilities serving an intent type, in name order.
    #[must_use]
    pub fn list_for_intent(&self, intent: &str) -> Vec<Capability> {
        self.caps
            .lock()
            .expect("capability lock poisoned")
            .values()
            .filter(|c| c.intent == intent)
            .cloned()
            .collect()
    }

    /// Sorted names of every registered capability.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.caps
            .lock()
            .expect("capability lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether any capability serves `intent`.
    #[must_use]
    pub fn has_intent(&self, intent: &str) -> bool {
        self.caps
            .lock()
            .expect("capability lock poisoned")
            .values()
            .any(|c| c.intent == intent)
    }

    /// Insert or replace a capability, re-validating the whole DAG.
    ///
    /// # Errors
    ///
    /// `CAPABILITY_INVALID` on record problems, `CAPABILITY_DEP_CYCLE` when
    /// the insertion would close a cycle, internal errors on persist failure.
    pub fn set(&self, name: &str, mut cap: Capability) -> ToolResult<()> {
        cap.name = name.to_string();
        validate_record(&cap)?;
        let mut caps = self.caps.lock().expect("capability lock poisoned");
        let previous = caps.insert(name.to_string(), cap);
        if let Err(err) = check_acyclic_map(&caps) {
            // Roll back so a bad record never lands in the registry.
            match previous {
                Some(prev) => caps.insert(name.to_string(), prev),
                None => caps.remove(name),
            };
            return Err(err);
        }
        self.persist(&caps)
    }

    /// Remove a capability.
    ///
    /// # Errors
    ///
    /// `CAPABILITY_NOT_FOUND` when absent; internal errors on persist failure.
    pub fn delete(&self, name: &str) -> ToolResult<()> {
        let mut caps = self.caps.lock().expect("capability lock poisoned");
        if caps.remove(name).is_none() {
            return Err(ToolError::new(
                ErrorCode::CapabilityNotFound,
                format!("capability '{name}' not found"),
            ));
        }
        self.persist(&caps)
    }

    /// Expand `root` and its dependencies in post-order (leaves first, root
    /// last), deduplicating shared dependencies.
    ///
    /// # Errors
    ///
    /// `CAPABILITY_NOT_FOUND` for a missing dependency,
    /// `CAPABILITY_DEP_CYCLE` when traversal revisits an in-progress node.
    pub fn expand_postorder(&self, root: &str) -> ToolResult<Vec<Capability>> {
        let caps = self.caps.lock().expect("capability lock poisoned");
        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        visit(&caps, root, &mut in_progress, &mut done, &mut order)?;
        Ok(order)
    }

    fn check_acyclic(&self) -> ToolResult<()> {
        let caps = self.caps.lock().expect("capability lock poisoned");
        check_acyclic_map(&caps)
    }

    fn persist(&self, caps: &BTreeMap<String, Capability>) -> ToolResult<()> {
        let json = serde_json::to_vec_pretty(caps)?;
        osp_paths::atomic_write(&self.path, &json)
            .map_err(|e| ToolError::internal(format!("persist capabilities: {e}")))
    }
}

fn validate_record(cap: &Capability) -> ToolResult<()> {
    if cap.intent.is_empty() {
        return Err(invalid(&cap.name, "intent must not be empty"));
    }
    if cap.runbook.is_empty() {
        return Err(invalid(&cap.name, "runbook must not be empty"));
    }
    if matches!(cap.effects.kind, EffectKind::Write | EffectKind::Mixed)
        && !cap.effects.requires_apply
    {
        return Err(invalid(
            &cap.name,
            "write/mixed effects must set requires_apply",
        ));
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> ToolError {
    ToolError::new(
        ErrorCode::CapabilityInvalid,
        format!("capability '{name}': {reason}"),
    )
}

fn check_acyclic_map(caps: &BTreeMap<String, Capability>) -> ToolResult<()> {
    for name in caps.keys() {
        let mut done = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        let mut order = Vec::new();
        match visit(caps, name, &mut in_progress, &mut done, &mut order) {
            Ok(()) => {}
            // Unknown dependencies are tolerated at load; resolution
            // surfaces them when the capability is actually planned.
            Err(err) if err.code == ErrorCode::CapabilityNotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn visit(
    caps: &BTreeMap<String, Capability>,
    name: &str,
    in_progress: &mut BTreeSet<String>,
    done: &mut BTreeSet<String>,
    order: &mut Vec<Capability>,
) -> ToolResult<()> {
    if done.contains(name) {
        return Ok(());
    }
    if !in_progress.insert(name.to_string()) {
        return Err(ToolError::new(
            ErrorCode::CapabilityDepCycle,
            format!("capability dependency cycle through '{name}'"),
        ));
    }
    let cap = caps.get(name).ok_or_else(|| {
        ToolError::new(
            ErrorCode::CapabilityNotFound,
            format!("capability '{name}' not found"),
        )
    })?;
    for dep in &cap.depends_on {
        visit(caps, dep, in_progress, done, order)?;
    }
    in_progress.remove(name);
    done.insert(name.to_string());
    order.push(cap.clone());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cap(intent: &str, runbook: &str) -> Capability {
        Capability {
            name: String::new(),
            intent: intent.into(),
            runbook: runbook.into(),
            inputs: CapabilityInputs::default(),
            effects: Effects::read(),
            depends_on: Vec::new(),
            when: None,
            tags: Vec::new(),
        }
    }

    fn registry() -> (tempfile::TempDir, CapabilityRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = CapabilityRegistry::open(tmp.path().join("capabilities.json")).unwrap();
        (tmp, reg)
    }

    #[test]
    fn set_get_and_intent_listing() {
        let (_tmp, reg) = registry();
        reg.set("gitops.plan.flux", cap("gitops.plan", "rb.flux")).unwrap();
        reg.set("gitops.plan.argocd", cap("gitops.plan", "rb.argocd")).unwrap();
        reg.set("gitops.status", cap("gitops.status", "rb.status")).unwrap();

        let plans = reg.list_for_intent("gitops.plan");
        assert_eq!(plans.len(), 2);
        // BTreeMap gives lexicographic order.
        assert_eq!(plans[0].name, "gitops.plan.argocd");
        assert!(reg.has_intent("gitops.status"));
        assert!(!reg.has_intent("gitops.promote"));
        assert_eq!(reg.get("gitops.status").unwrap().runbook, "rb.status");
    }

    #[test]
    fn write_without_requires_apply_is_invalid() {
        let (_tmp, reg) = registry();
        let mut bad = cap("k8s.apply", "rb.apply");
        bad.effects = Effects {
            kind: EffectKind::Write,
            requires_apply: false,
        };
        let err = reg.set("k8s.apply", bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityInvalid);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let (_tmp, reg) = registry();
        let mut selfdep = cap("x", "rb");
        selfdep.depends_on = vec!["x".into()];
        let err = reg.set("x", selfdep).unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityDepCycle);
        // The bad record was rolled back.
        assert!(reg.get("x").is_none());
    }

    #[test]
    fn two_node_cycle_detected_and_rolled_back() {
        let (_tmp, reg) = registry();
        let mut a = cap("i", "rb");
        a.depends_on = vec!["b".into()];
        reg.set("a", a).unwrap();
        let mut b = cap("i", "rb");
        b.depends_on = vec!["a".into()];
        let err = reg.set("b", b).unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityDepCycle);
        assert!(reg.get("b").is_none());
    }

    #[test]
    fn postorder_leaves_first() {
        let (_tmp, reg) = registry();
        reg.set("leaf1", cap("i", "rb")).unwrap();
        reg.set("leaf2", cap("i", "rb")).unwrap();
        let mut mid = cap("i", "rb");
        mid.depends_on = vec!["leaf1".into()];
        reg.set("mid", mid).unwrap();
        let mut root = cap("i", "rb");
        root.depends_on = vec!["mid".into(), "leaf2".into()];
        reg.set("root", root).unwrap();

        let order: Vec<String> = reg
            .expand_postorder("root")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(order, vec!["leaf1", "mid", "leaf2", "root"]);
    }

    #[test]
    fn shared_dependency_appears_once() {
        let (_tmp, reg) = registry();
        reg.set("shared", cap("i", "rb")).unwrap();
        let mut a = cap("i", "rb");
        a.depends_on = vec!["shared".into()];
        reg.set("a", a).unwrap();
        let mut root = cap("i", "rb");
        root.depends_on = vec!["a".into(), "shared".into()];
        reg.set("root", root).unwrap();

        let order: Vec<String> = reg
            .expand_postorder("root")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(order, vec!["shared", "a", "root"]);
    }

    #[test]
    fn missing_dependency_surfaces_at_expansion() {
        let (_tmp, reg) = registry();
        let mut root = cap("i", "rb");
        root.depends_on = vec!["ghost".into()];
        reg.set("root", root).unwrap();
        let err = reg.expand_postorder("root").unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[test]
    fn tag_predicates() {
        let tags: Vec<String> = vec!["flux".into(), "git".into(), "gitops".into()];
        assert!(TagPredicate::TagsAny(vec!["argocd".into(), "flux".into()]).matches(&tags));
        assert!(!TagPredicate::TagsAny(vec!["argocd".into()]).matches(&tags));
        assert!(TagPredicate::TagsAll(vec!["flux".into(), "git".into()]).matches(&tags));
        assert!(!TagPredicate::TagsAll(vec!["flux".into(), "argocd".into()]).matches(&tags));
        assert!(TagPredicate::TagsNone(vec!["argocd".into()]).matches(&tags));
        assert!(TagPredicate::Not(Box::new(TagPredicate::TagsAny(vec!["argocd".into()])))
            .matches(&tags));
        assert!(TagPredicate::And(vec![
            TagPredicate::TagsAny(vec!["flux".into()]),
            TagPredicate::TagsNone(vec!["argocd".into()]),
        ])
        .matches(&tags));
        assert!(TagPredicate::Or(vec![
            TagPredicate::TagsAny(vec!["argocd".into()]),
            TagPredicate::TagsAny(vec!["flux".into()]),
        ])
        .matches(&tags));
    }

    #[test]
    fn predicate_wire_shape() {
        let pred: TagPredicate = serde_json::from_value(json!({"tags_any": ["argocd"]})).unwrap();
        assert_eq!(pred, TagPredicate::TagsAny(vec!["argocd".into()]));
        let pred: TagPredicate = serde_json::from_value(json!({
            "and": [{"tags_any": ["flux"]}, {"tags_none": ["argocd"]}]
        }))
        .unwrap();
        assert!(matches!(pred, TagPredicate::And(_)));
        assert!(serde_json::from_value::<TagPredicate>(json!({"tags_weird": []})).is_err());
    }

    #[test]
    fn effects_aggregation() {
        let read = Effects::read();
        let write = Effects {
            kind: EffectKind::Write,
            requires_apply: true,
        };
        let mixed = Effects {
            kind: EffectKind::Mixed,
            requires_apply: true,
        };
        let agg = Effects::aggregate([&read, &read]);
        assert_eq!(agg.kind, EffectKind::Read);
        assert!(!agg.requires_apply);
        let agg = Effects::aggregate([&read, &write]);
        assert_eq!(agg.kind, EffectKind::Write);
        assert!(agg.requires_apply);
        let agg = Effects::aggregate([&write, &mixed, &read]);
        assert_eq!(agg.kind, EffectKind::Mixed);
    }

    #[test]
    fn registry_reload_validates_and_fills_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("capabilities.json");
        {
            let reg = CapabilityRegistry::open(&path).unwrap();
            let mut c = cap("gitops.plan", "rb.plan");
            c.when = Some(TagPredicate::TagsAny(vec!["flux".into()]));
            reg.set("gitops.plan.flux", c).unwrap();
        }
        let reg = CapabilityRegistry::open(&path).unwrap();
        let loaded = reg.get("gitops.plan.flux").unwrap();
        assert_eq!(loaded.name, "gitops.plan.flux");
        assert!(loaded.when.is_some());
    }
}
