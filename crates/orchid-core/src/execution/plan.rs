//! Plan Executor: tree traversal over a `PlanDefinition` -- the depth
//! guard, the single per-execution deadline, `while`-loop repetition,
//! `iterate_over` fanout with bounded concurrency, and recursive sub-steps
//! Every leaf request is delegated to
//! `execution::step::execute_step`; this module never calls the HTTP
//! Requestor directly.
//!
//! Fanout concurrency is a `tokio::sync::Semaphore` + `JoinSet`, scoped to
//! this one execution -- deliberately distinct from the rate limiter's
//! Redis-backed concurrency cap, which is shared cluster-wide (see
//! `ratelimit::RateLimiter`'s module doc).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use orchid_db::models::{ErrorType, ExecutionStatus};

use crate::execution::context::ExecutionContext;
use crate::execution::emission::StepEmission;
use crate::execution::step::{self, StepDeps, StepError, StepOutcome, StepStatus};
use crate::execution::types::{FanoutEmitMode, PlanDefinition, Step};
use crate::expressions::as_array;
use crate::ratelimit::RateLimitConfig;

impl StepError {
    fn persisted(&self) -> ErrorType {
        match self {
            StepError::RateLimit(_) => ErrorType::RateLimit,
            StepError::Timeout => ErrorType::Timeout,
            StepError::Template(_) | StepError::Expr(_) | StepError::Permanent(_) | StepError::Aborted(_) => {
                ErrorType::Permanent
            }
            StepError::Transient(_) | StepError::Cancelled | StepError::Db(_) | StepError::Auth(_) => {
                ErrorType::Transient
            }
        }
    }
}

/// The outcome of one root plan invocation: the `plan_executions.id` row
/// that was created for it (so callers -- the Processor -- can attach it
/// to a DLQ entry or a retry log line) plus the tree-traversal result.
/// A bare `anyhow::Error` from `execute_plan` means the execution row
/// itself could never be created or marked terminal (a DB outage), which
/// the Processor treats as its own transient failure.
pub struct PlanRunOutcome {
    pub execution_id: Uuid,
    pub result: Result<StepOutcome, StepError>,
}

/// Run one root plan invocation end to end: creates the `plan_executions`
/// audit row, runs the tree, records the terminal status and rolling
/// statistics, and returns the root node's outcome alongside the
/// execution id it was recorded under.
#[allow(clippy::too_many_arguments)]
pub async fn execute_plan(
    plan: &PlanDefinition,
    tenant_id: Uuid,
    integration: &str,
    plan_key: &str,
    config_id: Uuid,
    config_values: serde_json::Value,
    parent_execution_id: Option<Uuid>,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
) -> anyhow::Result<PlanRunOutcome> {
    let execution = orchid_db::queries::plan_executions::insert_pending_execution(
        &deps.db,
        tenant_id,
        plan_key,
        config_id,
        parent_execution_id,
        "root",
    )
    .await?;
    orchid_db::queries::plan_executions::mark_running(&deps.db, execution.id).await?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(plan.max_execution_seconds);

    let mut ctx = ExecutionContext::new(plan_key, config_id, execution.id, config_values, std::collections::HashMap::new());

    let result = execute_node(
        &plan.root_step,
        &mut ctx,
        tenant_id,
        integration,
        0,
        plan.max_nesting_depth,
        rate_limits,
        deps,
        cancel,
        deadline,
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as f64;

    let (status, error_message, error_type) = match &result {
        Ok(outcome) => {
            let status = match outcome.status {
                StepStatus::Success => ExecutionStatus::Success,
                StepStatus::Ignored => ExecutionStatus::Success,
            };
            (status, None, None)
        }
        Err(StepError::Aborted(msg)) => (ExecutionStatus::Aborted, Some(msg.clone()), Some(ErrorType::Permanent)),
        Err(e @ StepError::Timeout) => (ExecutionStatus::Aborted, Some(e.to_string()), Some(ErrorType::Timeout)),
        Err(e) => (ExecutionStatus::Failed, Some(e.to_string()), Some(e.persisted())),
    };

    orchid_db::queries::plan_executions::mark_terminal(
        &deps.db,
        execution.id,
        status,
        error_message.as_deref(),
        error_type,
        ctx.meta.attempt as i32,
    )
    .await?;

    orchid_db::queries::plan_statistics::record_outcome(
        &deps.db,
        tenant_id,
        plan_key,
        config_id,
        matches!(status, ExecutionStatus::Success),
        duration_ms,
    )
    .await?;

    info!(plan_key, execution_id = %execution.id, status = %status, duration_ms, "plan execution finished");

    Ok(PlanRunOutcome {
        execution_id: execution.id,
        result,
    })
}

/// Execute one tree node: the node's own request (honoring `while`), then
/// its fanout (if `iterate_over` + `sub_steps`) or plain sequential
/// sub-steps (if `sub_steps` alone), recursively.
#[allow(clippy::too_many_arguments)]
async fn execute_node(
    step: &Step,
    ctx: &mut ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    depth: u32,
    max_depth: u32,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<StepOutcome, StepError> {
    if depth > max_depth {
        return Err(StepError::Permanent(format!(
            "max nesting depth {max_depth} exceeded at step_path {}",
            ctx.meta.step_path
        )));
    }

    let outcome = if step.has_while_loop() {
        run_while_loop(step, ctx, tenant_id, integration, rate_limits, deps, cancel, deadline).await?
    } else {
        step::execute_step(step, ctx, tenant_id, integration, rate_limits, deps, cancel, deadline).await?
    };

    if outcome.status == StepStatus::Ignored {
        return Ok(outcome);
    }

    if step.is_fanout() {
        run_fanout(step, ctx, tenant_id, integration, depth, max_depth, rate_limits, deps, cancel, deadline).await?;
    } else if !step.sub_steps.is_empty() {
        for sub in &step.sub_steps {
            Box::pin(execute_node(
                sub, ctx, tenant_id, integration, depth + 1, max_depth, rate_limits, deps, cancel, deadline,
            ))
            .await?;
        }
    }

    Ok(outcome)
}

/// Re-issue `step`'s own request while `step.while_` evaluates true,
/// capped at `EngineConfig::DEFAULT_MAX_LOOPS` iterations regardless of
/// the expression's value.
#[allow(clippy::too_many_arguments)]
async fn run_while_loop(
    step: &Step,
    ctx: &mut ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<StepOutcome, StepError> {
    let max_loops = crate::config::EngineConfig::DEFAULT_MAX_LOOPS;
    let expr = step.while_.as_deref().expect("has_while_loop implies while_ is Some");

    let mut last = None;
    for iteration in 0..max_loops {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(StepError::Timeout);
        }

        let outcome = step::execute_step(step, ctx, tenant_id, integration, rate_limits, deps, cancel, deadline).await?;
        let should_continue = !outcome.break_loop && outcome.status == StepStatus::Success;
        last = Some(outcome);

        if !should_continue {
            break;
        }

        let data = ctx.to_value();
        let continues = deps
            .templater
            .cache()
            .evaluate(expr, &data)
            .map(|v| crate::expressions::as_bool(&v))
            .map_err(StepError::Expr)?;

        if !continues {
            break;
        }

        if iteration + 1 == max_loops {
            warn!(step_path = %ctx.meta.step_path, max_loops, "while loop hit MAX_LOOPS cap");
        }
    }

    Ok(last.expect("run_while_loop always executes at least one iteration"))
}

/// Evaluate `iterate_over` against the fresh response, then run each
/// item's `sub_steps` under a derived child context, bounded by
/// `step.concurrency` concurrent items.
#[allow(clippy::too_many_arguments)]
async fn run_fanout(
    step: &Step,
    ctx: &mut ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    depth: u32,
    max_depth: u32,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), StepError> {
    let expr = step.iterate_over.as_deref().expect("is_fanout implies iterate_over is Some");
    let data = ctx.to_value();
    let items = deps
        .templater
        .cache()
        .evaluate(expr, &data)
        .map(|v| as_array(&v))
        .map_err(StepError::Expr)?;

    if items.is_empty() {
        ctx.fanout = Vec::new();
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(step.concurrency.max(1) as usize));
    // Only an `abort_on` hit inside an item propagates as a parent-level
    // failure (`Err`); any other sub-step failure -- exhausted retries,
    // a non-abort permanent status, an ignored step -- already emitted
    // its own error-topic message and contributes a `null` item instead
    // of failing the whole fanout (spec.md §4.H: "a permanent sub-step
    // failure does not fail the parent unless that sub-step reaches
    // abort_on").
    let mut tasks: JoinSet<Result<(usize, Option<serde_json::Value>), StepError>> = JoinSet::new();
    let integration = integration.to_owned();

    for (index, item) in items.into_iter().enumerate() {
        let permit_sem = semaphore.clone();
        let mut child_ctx = ctx.derive_for_item(item, index);
        let step = step.clone();
        let rate_limits = rate_limits.to_vec();
        let deps = deps.clone();
        let cancel = cancel.clone();
        let integration = integration.clone();

        tasks.spawn(async move {
            let _permit = permit_sem.acquire_owned().await.expect("semaphore never closed");

            for sub in &step.sub_steps {
                match Box::pin(execute_node(
                    sub, &mut child_ctx, tenant_id, &integration, depth + 1, max_depth, &rate_limits, &deps, &cancel, deadline,
                ))
                .await
                {
                    Ok(_) => {}
                    Err(e @ (StepError::Aborted(_) | StepError::Cancelled | StepError::Timeout)) => return Err(e),
                    Err(_) => return Ok((index, None)),
                }
            }

            Ok((index, Some(child_ctx.to_value())))
        });
    }

    let mut results: Vec<(usize, Option<serde_json::Value>)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(pair)) => results.push(pair),
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(StepError::Transient(format!("fanout item task panicked: {join_err}")));
            }
        }
    }

    results.sort_by_key(|(index, _)| *index);
    ctx.fanout = results.into_iter().map(|(_, value)| value.unwrap_or(serde_json::Value::Null)).collect();

    if step.fanout_emit_mode == FanoutEmitMode::Page && step.emit_to_kafka {
        let payload = StepEmission {
            tenant_id,
            integration: integration.clone(),
            plan_key: ctx.meta.plan_key.clone(),
            config_id: ctx.meta.config_id,
            execution_id: ctx.meta.execution_id,
            step_path: ctx.meta.step_path.clone(),
            timestamp: ctx.meta.timestamp,
            request_method: step.method.clone(),
            request_url: step.url.clone(),
            status_code: ctx.response.as_ref().map(|r| r.status_code),
            response_headers: std::collections::HashMap::new(),
            response_body: serde_json::Value::Array(ctx.fanout.clone()),
            duration_ms: 0,
            size_bytes: 0,
            attempt: ctx.meta.attempt,
            error_kind: None,
            error_message: None,
        };
        if let Err(e) = deps.emitter.emit_success(&payload).await {
            warn!(error = %e, step_path = %ctx.meta.step_path, "failed to emit fanout page");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_error_type_classification() {
        assert_eq!(StepError::RateLimit("x".into()).persisted(), ErrorType::RateLimit);
        assert_eq!(StepError::Permanent("x".into()).persisted(), ErrorType::Permanent);
        assert_eq!(StepError::Aborted("x".into()).persisted(), ErrorType::Permanent);
        assert_eq!(StepError::Timeout.persisted(), ErrorType::Timeout);
    }
}
