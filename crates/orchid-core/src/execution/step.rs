//! Step Executor: single-step semantics -- template resolution, auth
//! injection, rate-limit admission, the HTTP call, status-code policy,
//! retry-with-backoff, and context/emission side effects -- described in
//! §4.G's eleven-point algorithm. Tree traversal (`while`, `iterate_over`
//! fanout, recursive sub-steps) lives one layer up in `execution::plan`;
//! this module only ever issues the *one* request a `Step` node describes.

use std::time::Duration;

use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthManager;
use crate::execution::context::ExecutionContext;
use crate::execution::emission::{Emitter, StepEmission};
use crate::execution::types::{RetryConfig, Step};
use crate::expressions::template::{TemplateError, Templater};
use crate::expressions::{as_bool, ExprError};
use crate::http::{HttpError, HttpRequestor, ResolvedRequest};
use crate::ratelimit::{RateLimitConfig, RateLimiter};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("auth error: {0}")]
    Auth(Box<crate::auth::AuthError>),
    #[error("permanent error: {0}")]
    Permanent(String),
    #[error("step aborted: {0}")]
    Aborted(String),
    #[error("step timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
}

impl From<crate::auth::AuthError> for StepError {
    fn from(e: crate::auth::AuthError) -> Self {
        StepError::Auth(Box::new(e))
    }
}

impl StepError {
    /// The error-taxonomy tag, used both as the Kafka
    /// emission's `error_kind` and to decide DLQ/retry handling upstream.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Template(_) => "template_error",
            StepError::Expr(_) => "template_error",
            StepError::Transient(_) | StepError::Timeout => "transient",
            StepError::RateLimit(_) => "rate_limit",
            StepError::Auth(_) => "auth",
            StepError::Permanent(_) => "permanent",
            StepError::Aborted(_) => "permanent",
            StepError::Cancelled => "transient",
            StepError::Db(_) => "transient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Ignored,
}

/// The result of running one step node to a terminal (non-retrying)
/// outcome. `response` is `None` only when the step was ignored before a
/// request was ever sent.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub response: Option<crate::http::ResponseEnvelope>,
    /// Set when `break_when` evaluated true; the enclosing `while` loop
    /// (owned by `execution::plan`) should stop after this iteration.
    pub break_loop: bool,
}

/// Dependencies shared by every `execute_step` call in a process, built
/// once and cloned cheaply (every field is itself a thin handle: a pooled
/// connection manager, a `reqwest::Client`, an `Arc`-backed cache, or a
/// `sqlx::PgPool`).
#[derive(Clone)]
pub struct StepDeps {
    pub templater: Templater,
    pub rate_limiter: RateLimiter,
    pub http: HttpRequestor,
    pub auth: AuthManager,
    pub emitter: Emitter,
    pub db: PgPool,
}

struct ConcurrencyGuard<'a> {
    limiter: &'a RateLimiter,
    bucket_key: String,
    held: bool,
}

impl<'a> ConcurrencyGuard<'a> {
    async fn release(mut self) {
        if self.held {
            if let Err(e) = self.limiter.release_concurrency(&self.bucket_key).await {
                warn!(error = %e, bucket = %self.bucket_key, "failed to release rate-limit concurrency slot");
            }
            self.held = false;
        }
    }
}

/// Execute `step` once (including its own retry loop), against `ctx`,
/// bounded by `deadline`. `rate_limits` is the enclosing plan's full
/// policy list; `execute_step` filters to those whose `endpoint_pattern`
/// matches the resolved URL.
#[allow(clippy::too_many_arguments)]
pub async fn execute_step(
    step: &Step,
    ctx: &mut ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<StepOutcome, StepError> {
    let mut attempt: u32 = 0;

    loop {
        ctx.meta.attempt = attempt;

        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let outcome = execute_one_attempt(step, ctx, tenant_id, integration, rate_limits, deps, cancel, deadline).await;

        match outcome {
            Ok(terminal) => return Ok(terminal),
            Err(RetryDecision::Terminal(e)) => {
                emit_terminal_failure(deps, ctx, tenant_id, integration, step, &e).await;
                return Err(e);
            }
            Err(RetryDecision::Retry(e)) => {
                let retry_cfg = match &step.retry {
                    Some(cfg) => cfg,
                    None => {
                        emit_terminal_failure(deps, ctx, tenant_id, integration, step, &e).await;
                        return Err(e);
                    }
                };
                if attempt >= retry_cfg.max_retries {
                    emit_terminal_failure(deps, ctx, tenant_id, integration, step, &e).await;
                    return Err(e);
                }
                let delay = retry_cfg.delay_for(attempt + 1);
                if !sleep_or_cancel(delay, deadline, cancel).await {
                    emit_terminal_failure(deps, ctx, tenant_id, integration, step, &StepError::Timeout).await;
                    return Err(StepError::Timeout);
                }
                attempt += 1;
            }
        }
    }
}

/// Emit a single error-topic message for a step that ultimately failed
/// without ever reaching the status-code policy's own terminal branches
/// (those -- `abort_on`, `ignore_on`/`ignore_when`, the non-retryable
/// status path -- already emit inline against the real response, per
/// once it decides the step is done). This keeps "exactly one emission per
/// completed step" true even though a step may
/// fail several HTTP attempts before its retry budget is exhausted:
/// intermediate attempts never emit, only the final one.
async fn emit_terminal_failure(deps: &StepDeps, ctx: &ExecutionContext, tenant_id: Uuid, integration: &str, step: &Step, error: &StepError) {
    if matches!(error, StepError::Aborted(_) | StepError::Permanent(_) | StepError::Template(_) | StepError::Expr(_)) {
        // Already emitted (Aborted/Permanent) or intentionally silent
        // (Template/Expr -- DLQ-only, never worker-retried).
        return;
    }
    emit(deps, ctx, tenant_id, integration, step, None, Some((error.kind(), error.to_string()))).await;
}

/// Distinguishes a retryable failure (loop again, subject to `retry` /
/// `max_retries`) from one that is terminal regardless of retry budget
/// (abort, ignore, permanent, auth, cancellation).
enum RetryDecision {
    Retry(StepError),
    Terminal(StepError),
}

#[allow(clippy::too_many_arguments)]
async fn execute_one_attempt(
    step: &Step,
    ctx: &mut ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    rate_limits: &[RateLimitConfig],
    deps: &StepDeps,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<StepOutcome, RetryDecision> {
    // 1. Template resolution.
    let data = ctx.to_value();
    let (url, url_err) = deps.templater.render(&step.url, &data);
    let mut headers = std::collections::HashMap::new();
    let mut template_err = url_err;
    for (name, value) in &step.headers {
        let (rendered, err) = deps.templater.render(value, &data);
        headers.insert(name.clone(), rendered);
        template_err = template_err.or(err);
    }
    let mut query_params = std::collections::HashMap::new();
    for (name, value) in &step.query_params {
        let (rendered, err) = deps.templater.render(value, &data);
        query_params.insert(name.clone(), rendered);
        template_err = template_err.or(err);
    }
    let (body, body_err) = match &step.body {
        Some(b) => {
            let (rendered, err) = deps.templater.render_value(b, &data);
            (Some(rendered), err)
        }
        None => (None, None),
    };
    template_err = template_err.or(body_err);

    if let Some(err) = template_err {
        return Err(RetryDecision::Terminal(StepError::Template(err)));
    }

    // 2. Auth injection.
    if let Some(auth_flow_id) = step.auth_flow_id {
        let auth_ctx = deps
            .auth
            .get_auth_context(auth_flow_id, tenant_id, ctx.meta.config_id, ctx.config.clone(), deps, cancel)
            .await
            .map_err(|e| RetryDecision::Retry(StepError::from(e)))?;
        for (name, value) in &auth_ctx.headers {
            headers.entry(name.clone()).or_insert_with(|| value.clone());
        }
        ctx.auth = Some(auth_ctx);
    }

    // 3. Rate-limit admission, including the concurrency cap.
    let matched: Vec<&RateLimitConfig> = rate_limits
        .iter()
        .filter(|cfg| endpoint_matches(cfg.endpoint_pattern.as_deref(), &url))
        .collect();

    let config_id_str = ctx.meta.config_id.to_string();
    let mut concurrency_guards = Vec::new();
    for cfg in &matched {
        let bucket_key = cfg.bucket_key(&config_id_str, &url);

        loop {
            let decision = deps
                .rate_limiter
                .allow(&bucket_key, cfg.requests, Duration::from_secs(cfg.window_secs))
                .await
                .map_err(|e| RetryDecision::Retry(StepError::RateLimit(e.to_string())))?;

            if decision.allowed {
                break;
            }
            if !sleep_or_cancel(decision.retry_in, deadline, cancel).await {
                return Err(RetryDecision::Terminal(StepError::RateLimit(format!(
                    "bucket {bucket_key} still saturated at deadline"
                ))));
            }
        }

        if cfg.max_concurrent > 0 {
            let acquired = deps
                .rate_limiter
                .acquire_concurrency(&bucket_key, cfg.max_concurrent, Duration::from_secs(step.timeout_seconds.max(1)))
                .await
                .map_err(|e| RetryDecision::Retry(StepError::RateLimit(e.to_string())))?;
            if !acquired {
                return Err(RetryDecision::Retry(StepError::RateLimit(format!(
                    "bucket {bucket_key} concurrency cap saturated"
                ))));
            }
            concurrency_guards.push(ConcurrencyGuard {
                limiter: &deps.rate_limiter,
                bucket_key,
                held: true,
            });
        }
    }

    let release_guards = |guards: Vec<ConcurrencyGuard<'_>>| async move {
        for guard in guards {
            guard.release().await;
        }
    };

    // 4. `abort_when` pre-check, evaluated before the request is sent.
    if let Some(expr) = &step.abort_when {
        let data = ctx.to_value();
        let truthy = match deps.templater.cache().evaluate(expr, &data) {
            Ok(v) => as_bool(&v),
            Err(e) => {
                release_guards(concurrency_guards).await;
                return Err(RetryDecision::Terminal(StepError::Expr(e)));
            }
        };
        if truthy {
            release_guards(concurrency_guards).await;
            return Err(RetryDecision::Terminal(StepError::Aborted(format!(
                "abort_when `{expr}` was true before the request"
            ))));
        }
    }

    // 5. Issue the request.
    let request = ResolvedRequest {
        method: step.method.clone(),
        url: url.clone(),
        headers,
        query_params,
        body,
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    let call_timeout = remaining.min(Duration::from_secs(step.timeout_seconds));

    let result = deps.http.execute_request(&request, call_timeout).await;
    release_guards(concurrency_guards).await;

    let response = match result {
        Ok(r) => r,
        // Per-attempt network failures are not emitted here: only the
        // final attempt (success, or retry-budget exhaustion) produces a
        // message, via `emit_terminal_failure` in `execute_step`.
        Err(HttpError::Timeout(_)) => return Err(RetryDecision::Retry(StepError::Timeout)),
        Err(e) => return Err(RetryDecision::Retry(StepError::Transient(e.to_string()))),
    };

    ctx.response = Some(response.clone());

    // 6. Dynamic rate-limit feedback from response headers.
    for cfg in &matched {
        if let Some(dynamic) = &cfg.dynamic {
            let bucket_key = cfg.bucket_key(&config_id_str, &url);
            if response.status_code == 429 {
                if let Some(header) = &dynamic.retry_after_header {
                    if let Some(value) = response.headers.get(&header.to_lowercase()) {
                        if let Ok(secs) = value.parse::<u64>() {
                            let _ = deps.rate_limiter.block_for(&bucket_key, Duration::from_secs(secs)).await;
                        }
                    }
                }
            }
        }
    }

    // 7. Status-code policy.
    let fresh_data = ctx.to_value();

    if step.abort_on.contains(&response.status_code) {
        emit(deps, ctx, tenant_id, integration, step, Some(&response), Some(("permanent", format!("status {} is in abort_on", response.status_code)))).await;
        return Err(RetryDecision::Terminal(StepError::Aborted(format!(
            "status {} is in abort_on",
            response.status_code
        ))));
    }

    // 401 handling: invalidate the cached token and
    // retry exactly once per `auth_flow_id` per execution; a second 401
    // for the same flow is a permanent auth error, not another retry.
    if response.status_code == 401 {
        if let Some(auth_flow_id) = step.auth_flow_id {
            if ctx.auth_invalidated.insert(auth_flow_id) {
                if let Err(e) = deps.auth.invalidate(tenant_id, auth_flow_id, ctx.meta.config_id).await {
                    warn!(error = %e, %auth_flow_id, "failed to invalidate cached auth token after 401");
                }
                return Err(RetryDecision::Retry(StepError::Auth(Box::new(crate::auth::AuthError::TokenExtractionFailed(
                    "401 response; cached token invalidated, retrying once".to_owned(),
                )))));
            }

            // Emission happens centrally in `execute_step` via
            // `emit_terminal_failure`, keyed off this error's `kind()`.
            return Err(RetryDecision::Terminal(StepError::Auth(Box::new(
                crate::auth::AuthError::TokenExtractionFailed("persistent 401 after one invalidation".to_owned()),
            ))));
        }
    }

    let ignore_when_true = match &step.ignore_when {
        Some(expr) => match deps.templater.cache().evaluate(expr, &fresh_data) {
            Ok(v) => as_bool(&v),
            Err(e) => return Err(RetryDecision::Terminal(StepError::Expr(e))),
        },
        None => false,
    };

    if step.ignore_on.contains(&response.status_code) || ignore_when_true {
        emit(
            deps,
            ctx,
            tenant_id,
            integration,
            step,
            Some(&response),
            Some(("ignored", format!("status {} was ignored", response.status_code))),
        )
        .await;
        // Open question (SPEC_FULL.md §10): `set_context` is never
        // evaluated for an ignored step.
        return Ok(StepOutcome {
            status: StepStatus::Ignored,
            response: None,
            break_loop: false,
        });
    }

    if !response.is_success() {
        let retry_when_true = match &step.retry_when {
            Some(expr) => match deps.templater.cache().evaluate(expr, &fresh_data) {
                Ok(v) => as_bool(&v),
                Err(e) => return Err(RetryDecision::Terminal(StepError::Expr(e))),
            },
            None => false,
        };

        if retry_when_true {
            return Err(RetryDecision::Retry(StepError::Transient(format!(
                "status {} matched retry_when",
                response.status_code
            ))));
        }

        emit(
            deps,
            ctx,
            tenant_id,
            integration,
            step,
            Some(&response),
            Some(("permanent", format!("status {} was not successful", response.status_code))),
        )
        .await;
        return Err(RetryDecision::Terminal(StepError::Permanent(format!(
            "status {} was not successful",
            response.status_code
        ))));
    }

    // 8. `break_when`, evaluated on success only.
    let break_loop = match &step.break_when {
        Some(expr) => match deps.templater.cache().evaluate(expr, &fresh_data) {
            Ok(v) => as_bool(&v),
            Err(e) => return Err(RetryDecision::Terminal(StepError::Expr(e))),
        },
        None => false,
    };

    // 9. `set_context`, merged into both the in-memory context and the
    // durable `plan_context` table.
    for (key, expr) in &step.set_context {
        let value = deps
            .templater
            .cache()
            .evaluate(expr, &fresh_data)
            .map_err(|e| RetryDecision::Terminal(StepError::Expr(e)))?;
        ctx.set_context(key.clone(), value.clone());
        orchid_db::queries::plan_context::set_context_key(
            &deps.db,
            tenant_id,
            &ctx.meta.plan_key,
            ctx.meta.config_id,
            key,
            value,
        )
        .await
        .map_err(|e| RetryDecision::Terminal(StepError::Db(e)))?;
    }

    // 10. Emission.
    emit(deps, ctx, tenant_id, integration, step, Some(&response), None).await;

    Ok(StepOutcome {
        status: StepStatus::Success,
        response: Some(response),
        break_loop,
    })
}

#[allow(clippy::too_many_arguments)]
async fn emit(
    deps: &StepDeps,
    ctx: &ExecutionContext,
    tenant_id: Uuid,
    integration: &str,
    step: &Step,
    response: Option<&crate::http::ResponseEnvelope>,
    error: Option<(&'static str, String)>,
) {
    if !step.emit_to_kafka {
        return;
    }

    let payload = StepEmission {
        tenant_id,
        integration: integration.to_owned(),
        plan_key: ctx.meta.plan_key.clone(),
        config_id: ctx.meta.config_id,
        execution_id: ctx.meta.execution_id,
        step_path: ctx.meta.step_path.clone(),
        timestamp: ctx.meta.timestamp,
        request_method: step.method.clone(),
        request_url: step.url.clone(),
        status_code: response.map(|r| r.status_code),
        response_headers: response.map(|r| r.headers.clone()).unwrap_or_default(),
        response_body: response.map(|r| r.body.clone()).unwrap_or(serde_json::Value::Null),
        duration_ms: response.map(|r| r.duration_ms).unwrap_or_default(),
        size_bytes: response.map(|r| r.size_bytes).unwrap_or_default(),
        attempt: ctx.meta.attempt,
        error_kind: error.as_ref().map(|(kind, _)| (*kind).to_owned()),
        error_message: error.map(|(_, msg)| msg),
    };

    let result = if payload.error_kind.is_some() {
        deps.emitter.emit_error(&payload).await
    } else {
        deps.emitter.emit_success(&payload).await
    };

    if let Err(e) = result {
        warn!(error = %e, plan_key = %ctx.meta.plan_key, step_path = %ctx.meta.step_path, "failed to emit step result to kafka");
    }
}

/// Sleep for `duration`, capped at the remaining time until `deadline`,
/// racing cooperative cancellation. Returns `false` if the deadline or
/// cancellation fired first.
async fn sleep_or_cancel(duration: Duration, deadline: Instant, cancel: &CancellationToken) -> bool {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return false;
    }
    let capped = duration.min(remaining);
    tokio::select! {
        _ = tokio::time::sleep(capped) => capped == duration,
        _ = cancel.cancelled() => false,
    }
}

/// Matches an `endpoint_pattern` against a resolved URL. `None` matches
/// every URL (a plan-global limiter). A literal `*` is treated as a
/// wildcard segment; anything else must match as a substring, mirroring
/// how the external interface documents simple glob patterns rather than
/// full regex.
fn endpoint_matches(pattern: Option<&str>, url: &str) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if !pattern.contains('*') {
        return url.contains(pattern);
    }
    let mut rest = url;
    for (i, part) in pattern.split('*').enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => {
                if i == 0 && idx != 0 && !pattern.starts_with('*') {
                    return false;
                }
                rest = &rest[idx + part.len()..];
            }
            None => return false,
        }
    }
    true
}
