// SPDX-License-Identifier: MIT OR Apache-2.0
//! The runbook step interpreter.
//!
//! Steps run in declared order. Each step sees a context of
//! `{input, state, steps, trace_id, span_id, parent_span_id}` plus
//! `item`/`index` inside a `foreach` and `attempt` inside a retry loop.
//! The state snapshot is refreshed between steps so a step observes writes
//! made by earlier steps through the state tool.

use crate::{
    Foreach, RetrySpec, Runbook, Step, ToolInvoker, TraceContext, FOREACH_PARALLEL_CAP,
    MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS, RETRY_BUDGET_MS,
};
use osp_error::{ErrorCode, ToolError, ToolResult};
use osp_store::{Scope, StateStore};
use osp_template::TemplateEngine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Result of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step id.
    pub id: String,
    /// Tool the step invoked.
    pub tool: String,
    /// Whether the step counts as successful.
    pub success: bool,
    /// Whether the step's `when` guard skipped it.
    #[serde(default)]
    pub skipped: bool,
    /// Shaped result (array of per-item results for `foreach`).
    pub result: Value,
    /// Envelope metadata of the (last) invocation.
    pub meta: Value,
    /// Error payload when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Attempts used by a retry step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl StepOutcome {
    fn skipped(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            tool: step.tool.clone(),
            success: true,
            skipped: true,
            result: Value::Null,
            meta: Value::Null,
            error: None,
            attempts: None,
        }
    }

    fn success(step: &Step, result: Value, meta: Value) -> Self {
        Self {
            id: step.id.clone(),
            tool: step.tool.clone(),
            success: true,
            skipped: false,
            result,
            meta,
            error: None,
            attempts: None,
        }
    }

    fn failure(step: &Step, error: &ToolError) -> Self {
        Self {
            id: step.id.clone(),
            tool: step.tool.clone(),
            success: false,
            skipped: false,
            result: Value::Null,
            meta: Value::Null,
            error: serde_json::to_value(error).ok(),
            attempts: None,
        }
    }
}

/// Result of a full runbook run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookOutcome {
    /// `true` when every non-skipped step succeeded (or was allowed to fail).
    pub success: bool,
    /// Per-step outcomes in execution order.
    pub steps: Vec<StepOutcome>,
}

/// Interprets runbooks against the tool layer.
pub struct RunbookEngine {
    invoker: Arc<dyn ToolInvoker>,
    state: Arc<StateStore>,
    parallel_cap: usize,
}

impl std::fmt::Debug for RunbookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunbookEngine")
            .field("parallel_cap", &self.parallel_cap)
            .finish()
    }
}

impl RunbookEngine {
    /// Build an engine over the given invoker and state store.
    pub fn new(invoker: Arc<dyn ToolInvoker>, state: Arc<StateStore>) -> Self {
        Self {
            invoker,
            state,
            parallel_cap: FOREACH_PARALLEL_CAP,
        }
    }

    /// Run a runbook to completion (or first failing step).
    ///
    /// # Errors
    ///
    /// Fails on definition problems; step failures are reported in the
    /// outcome, not as an `Err`.
    pub async fn run(
        &self,
        runbook: &Runbook,
        input: Value,
        trace: &TraceContext,
    ) -> ToolResult<RunbookOutcome> {
        runbook.validate()?;
        let templates = TemplateEngine::new(runbook.template_missing.unwrap_or_default());

        let mut ctx = json!({
            "input": input,
            "state": self.state.dump(Scope::Any),
            "steps": {},
            "trace_id": trace.trace_id,
            "span_id": trace.span_id,
            "parent_span_id": trace.parent_span_id,
        });

        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(runbook.steps.len());
        let mut success = true;

        for step in &runbook.steps {
            // Later steps observe state writes made by earlier ones.
            ctx["state"] = json!(self.state.dump(Scope::Any));

            if let Some(when) = &step.when {
                if !when.matches(&ctx) {
                    debug!(target: "osp.runbook", step = %step.id, "when guard skipped step");
                    let outcome = StepOutcome::skipped(step);
                    record(&mut ctx, &mut outcomes, outcome);
                    continue;
                }
            }

            let outcome = if let Some(foreach) = &step.foreach {
                self.run_foreach(step, foreach, &templates, &ctx, trace).await
            } else if let Some(retry) = &step.retry {
                self.run_retry(step, retry, &templates, &ctx, trace).await
            } else {
                self.run_single(step, &templates, &ctx, trace).await
            };

            let failed = !outcome.success;
            record(&mut ctx, &mut outcomes, outcome);

            if failed {
                warn!(target: "osp.runbook", step = %step.id, "step failed");
                if !step.continue_on_error {
                    success = false;
                    break;
                }
            }
        }

        Ok(RunbookOutcome {
            success: success && outcomes.iter().all(|o| o.success || o.skipped),
            steps: outcomes,
        })
    }

    async fn run_single(
        &self,
        step: &Step,
        templates: &TemplateEngine,
        ctx: &Value,
        trace: &TraceContext,
    ) -> StepOutcome {
        let args = match templates.expand(&step.args, ctx) {
            Ok(args) => args,
            Err(err) => return StepOutcome::failure(step, &err),
        };
        match self.invoker.invoke(&step.tool, args, &trace.child()).await {
            Ok(invocation) => StepOutcome::success(step, invocation.result, invocation.meta),
            Err(err) => StepOutcome::failure(step, &err),
        }
    }

    async fn run_foreach(
        &self,
        step: &Step,
        foreach: &Foreach,
        templates: &TemplateEngine,
        ctx: &Value,
        trace: &TraceContext,
    ) -> StepOutcome {
        let items = match templates.expand(&foreach.items, ctx) {
            Ok(resolved) => resolved,
            Err(err) => return StepOutcome::failure(step, &err),
        };
        let Value::Array(items) = items else {
            return StepOutcome::failure(
                step,
                &ToolError::new(
                    ErrorCode::ForeachNotArray,
                    format!("step '{}': foreach.items did not resolve to an array", step.id),
                ),
            );
        };

        let mut results: Vec<Value> = Vec::with_capacity(items.len());
        if foreach.parallel {
            let semaphore = Arc::new(Semaphore::new(self.parallel_cap));
            let futures = items.into_iter().enumerate().map(|(index, item)| {
                let semaphore = Arc::clone(&semaphore);
                let invoker = Arc::clone(&self.invoker);
                let item_ctx = item_context(ctx, item, index);
                let args = templates.expand(&step.args, &item_ctx);
                let tool = step.tool.clone();
                let child = trace.child();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    match args {
                        Ok(args) => match invoker.invoke(&tool, args, &child).await {
                            Ok(inv) => item_result(index, true, inv.result, None),
                            Err(err) => item_result(index, false, Value::Null, Some(err)),
                        },
                        Err(err) => item_result(index, false, Value::Null, Some(err)),
                    }
                }
            });
            results.extend(futures::future::join_all(futures).await);
        } else {
            for (index, item) in items.into_iter().enumerate() {
                let item_ctx = item_context(ctx, item, index);
                let entry = match templates.expand(&step.args, &item_ctx) {
                    Ok(args) => match self.invoker.invoke(&step.tool, args, &trace.child()).await {
                        Ok(inv) => item_result(index, true, inv.result, None),
                        Err(err) => item_result(index, false, Value::Null, Some(err)),
                    },
                    Err(err) => item_result(index, false, Value::Null, Some(err)),
                };
                results.push(entry);
            }
        }

        let all_ok = results
            .iter()
            .all(|r| r["success"].as_bool().unwrap_or(false));
        StepOutcome {
            id: step.id.clone(),
            tool: step.tool.clone(),
            success: all_ok,
            skipped: false,
            result: Value::Array(results),
            meta: Value::Null,
            error: (!all_ok).then(|| {
                serde_json::to_value(ToolError::internal(format!(
                    "step '{}': one or more foreach items failed",
                    step.id
                )))
                .unwrap_or(Value::Null)
            }),
            attempts: None,
        }
    }

    async fn run_retry(
        &self,
        step: &Step,
        retry: &RetrySpec,
        templates: &TemplateEngine,
        ctx: &Value,
        trace: &TraceContext,
    ) -> StepOutcome {
        let max_attempts = retry.max_attempts.min(MAX_RETRY_ATTEMPTS);
        let single_cap = retry
            .max_delay_ms
            .unwrap_or(MAX_RETRY_DELAY_MS)
            .min(MAX_RETRY_DELAY_MS);
        let mut delay = retry.delay_ms.min(single_cap);
        let mut cumulative: u64 = 0;
        let mut last_error: Option<ToolError> = None;

        for attempt in 1..=max_attempts {
            let mut attempt_ctx = ctx.clone();
            attempt_ctx["attempt"] = json!(attempt);
            let args = match templates.expand(&step.args, &attempt_ctx) {
                Ok(args) => args,
                Err(err) => return StepOutcome::failure(step, &err),
            };

            match self.invoker.invoke(&step.tool, args, &trace.child()).await {
                Ok(invocation) => {
                    let satisfied = match &retry.until {
                        None => true,
                        Some(until) => until.matches(&json!({
                            "result": invocation.result,
                            "meta": invocation.meta,
                        })),
                    };
                    if satisfied {
                        let mut outcome =
                            StepOutcome::success(step, invocation.result, invocation.meta);
                        outcome.attempts = Some(attempt);
                        return outcome;
                    }
                    last_error = Some(ToolError::new(
                        ErrorCode::RetryExhausted,
                        format!("step '{}': until condition not met", step.id),
                    ));
                }
                Err(err) => {
                    if !retry.retry_on_error {
                        let mut outcome = StepOutcome::failure(step, &err);
                        outcome.attempts = Some(attempt);
                        return outcome;
                    }
                    last_error = Some(err);
                }
            }

            if attempt < max_attempts && delay > 0 {
                cumulative = cumulative.saturating_add(delay);
                if cumulative > RETRY_BUDGET_MS {
                    let err = ToolError::new(
                        ErrorCode::RetryBudgetExceeded,
                        format!(
                            "step '{}': cumulative retry delay {}ms exceeds the {}ms budget",
                            step.id, cumulative, RETRY_BUDGET_MS
                        ),
                    );
                    let mut outcome = StepOutcome::failure(step, &err);
                    outcome.attempts = Some(attempt);
                    return outcome;
                }
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                delay = ((delay as f64) * retry.backoff_factor.max(1.0)) as u64;
                delay = delay.min(single_cap);
            }
        }

        let detail = last_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "no attempt recorded".to_string());
        let err = ToolError::new(
            ErrorCode::RetryExhausted,
            format!("step '{}': retry failed after {max_attempts} attempts: {detail}", step.id),
        );
        let mut outcome = StepOutcome::failure(step, &err);
        outcome.attempts = Some(max_attempts);
        outcome
    }
}

fn record(ctx: &mut Value, outcomes: &mut Vec<StepOutcome>, outcome: StepOutcome) {
    ctx["steps"][outcome.id.as_str()] = json!({
        "success": outcome.success,
        "skipped": outcome.skipped,
        "result": outcome.result,
        "meta": outcome.meta,
    });
    outcomes.push(outcome);
}

fn item_context(ctx: &Value, item: Value, index: usize) -> Value {
    let mut item_ctx = ctx.clone();
    item_ctx["item"] = item;
    item_ctx["index"] = json!(index);
    item_ctx
}

fn item_result(index: usize, success: bool, result: Value, error: Option<ToolError>) -> Value {
    json!({
        "index": index,
        "success": success,
        "result": result,
        "error": error.and_then(|e| serde_json::to_value(e).ok()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
