//! Processor: the worker loop that pulls `plan_execution` jobs off the
//! Redis Streams job queue and runs them through the Plan Executor.
//!
//! Grounded on the corpus's `stream-worker` file: bounded concurrency via
//! a `Semaphore` + `JoinSet` (`process_jobs_concurrent`), a blocking
//! `XREADGROUP` loop with consecutive-error backoff, and a periodic
//! `XPENDING`/`XCLAIM` sweep to recover messages abandoned by a crashed
//! consumer.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use orchid_db::models::DlqReason;

use crate::config::EngineConfig;
use crate::execution::step::{StepDeps, StepError};
use crate::execution::types::PlanDefinition;
use crate::ratelimit::RateLimitConfig;
use crate::streams::types::{DlqJobEntry, JobMessage};
use crate::streams::{Delivery, JobStream};

/// Processor dependencies and run loop.
pub struct Processor {
    pool: PgPool,
    stream: JobStream,
    step_deps: StepDeps,
    config: Arc<EngineConfig>,
    consumer_name: String,
}

impl Processor {
    pub fn new(pool: PgPool, stream: JobStream, step_deps: StepDeps, config: Arc<EngineConfig>) -> Self {
        let consumer_name = format!("{}-{}", config.processor_consumer_name, Uuid::new_v4());
        Self { pool, stream, step_deps, config, consumer_name }
    }

    /// Run the consume loop and the periodic claim sweep concurrently
    /// until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        self.stream
            .create_group(&self.config.redis_streams_job_queue, &self.config.redis_streams_consumer_group)
            .await?;

        let consume_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.consume_loop(cancel).await })
        };
        let claim_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.claim_loop(cancel).await })
        };

        let _ = tokio::join!(consume_task, claim_task);
        Ok(())
    }

    async fn consume_loop(&self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.processor_concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let deliveries = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.stream.consume::<JobMessage>(
                    &self.config.redis_streams_job_queue,
                    &self.config.redis_streams_consumer_group,
                    &self.consumer_name,
                    self.config.processor_batch_size,
                    self.config.processor_block,
                ) => result,
            };

            let deliveries = match deliveries {
                Ok(d) => {
                    consecutive_errors = 0;
                    d
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.saturating_pow(consecutive_errors.min(4))).min(Duration::from_secs(30));
                    error!(error = %e, consecutive_errors, backoff_secs = backoff.as_secs(), "job stream read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            for delivery in deliveries {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let this_pool = self.pool.clone();
                let this_stream = self.stream.clone();
                let this_deps = self.step_deps.clone();
                let this_config = self.config.clone();
                let cancel = cancel.clone();

                tasks.spawn(async move {
                    let _permit = permit;
                    handle_delivery(delivery, &this_pool, &this_stream, &this_deps, &this_config, &cancel).await;
                });
            }

            // Drain completed tasks without blocking the next read.
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        info!("processor consume loop stopped");
    }

    async fn claim_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.processor_claim_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("processor claim loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_abandoned().await {
                        error!(error = %e, "claim sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep_abandoned(&self) -> anyhow::Result<()> {
        let pending = self
            .stream
            .pending(&self.config.redis_streams_job_queue, &self.config.redis_streams_consumer_group, 100)
            .await?;

        let idle_ids: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle >= self.config.processor_claim_idle)
            .map(|p| p.id)
            .collect();

        if idle_ids.is_empty() {
            return Ok(());
        }

        warn!(count = idle_ids.len(), "reclaiming abandoned job stream messages");

        let claimed: Vec<Delivery<JobMessage>> = self
            .stream
            .claim(
                &self.config.redis_streams_job_queue,
                &self.config.redis_streams_consumer_group,
                &self.consumer_name,
                self.config.processor_claim_idle,
                &idle_ids,
            )
            .await?;

        for delivery in claimed {
            handle_delivery(delivery, &self.pool, &self.stream, &self.step_deps, &self.config, &CancellationToken::new()).await;
        }

        Ok(())
    }
}

/// What should happen to a delivered job once `run_job` returns.
#[derive(Debug)]
enum JobOutcome {
    /// Terminal success, or a disabled plan silently skipped.
    Done,
    /// A transient/rate-limit failure: re-publish with `attempts+1`
    /// unless the job has already exhausted `max_job_attempts`, in which
    /// case dead-letter with `MaxRetriesExceeded`.
    Retryable { execution_id: Option<Uuid>, message: String },
    /// A failure that is terminal regardless of remaining attempts:
    /// dead-letter immediately with the given reason, no republish.
    DeadLetter { execution_id: Option<Uuid>, reason: DlqReason, message: String },
    /// A permanent per-step failure that already reached its terminal
    /// `PlanExecution` row and error-topic message already -- a DLQ entry
    /// too would just duplicate that record, so just ack.
    PermanentAlreadyRecorded,
}

/// Run one delivered job to completion: dispatch to the Plan Executor,
/// then ack, retry, or dead-letter based on the outcome.
async fn handle_delivery(
    delivery: Delivery<JobMessage>,
    pool: &PgPool,
    stream: &JobStream,
    step_deps: &StepDeps,
    config: &EngineConfig,
    cancel: &CancellationToken,
) {
    let job = delivery.payload.clone();
    let outcome = run_job(&job, pool, step_deps, cancel).await;

    match outcome {
        JobOutcome::Done | JobOutcome::PermanentAlreadyRecorded => {}
        JobOutcome::DeadLetter { execution_id, reason, message } => {
            dead_letter(&job, pool, stream, config, reason, &message, execution_id).await;
        }
        JobOutcome::Retryable { execution_id, message } => {
            warn!(job_id = %job.id, attempts = job.attempts, error = %message, "job execution failed transiently");

            if job.attempts + 1 >= config.max_job_attempts {
                dead_letter(&job, pool, stream, config, DlqReason::MaxRetriesExceeded, &message, execution_id).await;
            } else if let Err(publish_err) = stream.publish(&config.redis_streams_job_queue, &job.retried()).await {
                error!(error = %publish_err, job_id = %job.id, "failed to republish job for retry");
            }
        }
    }

    if let Err(ack_err) = stream.ack(&config.redis_streams_job_queue, &config.redis_streams_consumer_group, &[delivery.id.clone()]).await {
        warn!(error = %ack_err, id = %delivery.id, "failed to ack job after routing");
    }
}

/// Resolve the job's plan/config/integration and run it through the Plan
/// Executor, classifying the result into a [`JobOutcome`].
async fn run_job(job: &JobMessage, pool: &PgPool, step_deps: &StepDeps, cancel: &CancellationToken) -> JobOutcome {
    let payload = &job.payload;

    let plan_row = match orchid_db::queries::plans::get_plan_by_key(pool, payload.tenant_id, &payload.plan_key).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return JobOutcome::DeadLetter {
                execution_id: None,
                reason: DlqReason::PlanNotFound,
                message: format!("plan {} not found", payload.plan_key),
            }
        }
        Err(e) => return JobOutcome::Retryable { execution_id: None, message: e.to_string() },
    };

    if !plan_row.enabled {
        info!(plan_key = %payload.plan_key, "skipping job for disabled plan");
        return JobOutcome::Done;
    }

    let config_row = match orchid_db::queries::configs::get_config(pool, payload.config_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return JobOutcome::DeadLetter {
                execution_id: None,
                reason: DlqReason::ConfigError,
                message: format!("config {} not found", payload.config_id),
            }
        }
        Err(e) => return JobOutcome::Retryable { execution_id: None, message: e.to_string() },
    };

    let plan: PlanDefinition = match serde_json::from_value(plan_row.definition.clone()) {
        Ok(p) => p,
        Err(e) => {
            return JobOutcome::DeadLetter {
                execution_id: None,
                reason: DlqReason::InvalidJob,
                message: format!("plan {} has an unparseable definition: {e}", payload.plan_key),
            }
        }
    };

    let rate_limits: Vec<RateLimitConfig> = plan.rate_limits.clone();

    // A panicking step (e.g. a bug in a custom expression evaluator) must
    // not take the whole worker down; isolate via spawn and inspect the
    // JoinHandle for a panic.
    let plan_clone = plan.clone();
    let tenant_id = payload.tenant_id;
    let integration = payload.integration.clone();
    let plan_key = payload.plan_key.clone();
    let config_id = payload.config_id;
    let config_values = config_row.values.clone();
    let step_deps = step_deps.clone();
    let cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        crate::execution::plan::execute_plan(
            &plan_clone,
            tenant_id,
            &integration,
            &plan_key,
            config_id,
            config_values,
            None,
            &rate_limits,
            &step_deps,
            &cancel,
        )
        .await
    });

    match handle.await {
        Ok(Ok(run_outcome)) => classify_run_outcome(run_outcome),
        Ok(Err(e)) => JobOutcome::Retryable { execution_id: None, message: e.to_string() },
        Err(join_err) => JobOutcome::DeadLetter {
            execution_id: None,
            reason: DlqReason::Panic,
            message: format!("plan execution task panicked: {join_err}"),
        },
    }
}

/// Map a finished plan execution's result to worker-level routing:
/// `transient`/`rate_limit` get a
/// worker-level retry budget; `auth` and `template_error` dead-letter
/// immediately (no further worker retry helps); a deadline-exceeded
/// execution is already recorded `aborted`/`timeout` by the Plan Executor
/// and dead-letters with `DlqReason::Timeout` rather than being folded
/// into the generic transient-retry path (a timeout is not "try again",
/// it already used its whole execution budget); `permanent` was already
/// fully recorded by the Plan Executor (failed/aborted execution row +
/// error-topic message) and needs no DLQ entry.
fn classify_run_outcome(run_outcome: crate::execution::plan::PlanRunOutcome) -> JobOutcome {
    let execution_id = Some(run_outcome.execution_id);
    match run_outcome.result {
        Ok(_) => JobOutcome::Done,
        Err(e @ StepError::Timeout) => {
            JobOutcome::DeadLetter { execution_id, reason: DlqReason::Timeout, message: e.to_string() }
        }
        Err(e) => match e.kind() {
            "transient" | "rate_limit" => JobOutcome::Retryable { execution_id, message: e.to_string() },
            "auth" => JobOutcome::DeadLetter { execution_id, reason: DlqReason::AuthError, message: e.to_string() },
            "template_error" => JobOutcome::DeadLetter { execution_id, reason: DlqReason::InvalidJob, message: e.to_string() },
            _ => JobOutcome::PermanentAlreadyRecorded,
        },
    }
}

async fn dead_letter(
    job: &JobMessage,
    pool: &PgPool,
    stream: &JobStream,
    config: &EngineConfig,
    reason: DlqReason,
    error_message: &str,
    execution_id: Option<Uuid>,
) {
    let original_job = match serde_json::to_value(job) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, job_id = %job.id, "failed to serialize job for dead-lettering");
            return;
        }
    };

    let inserted = orchid_db::queries::dead_letters::insert_dead_letter(
        pool,
        job.tenant_id,
        Some(&job.payload.plan_key),
        Some(job.payload.config_id),
        execution_id,
        original_job,
        reason,
        Some(error_message),
        job.attempts as i32,
        None,
    )
    .await;

    let dlq_id = match inserted {
        Ok(row) => row.id,
        Err(e) => {
            error!(error = %e, job_id = %job.id, "failed to persist dead letter row");
            Uuid::new_v4()
        }
    };

    let entry = DlqJobEntry {
        id: dlq_id,
        tenant_id: job.tenant_id,
        plan_key: Some(job.payload.plan_key.clone()),
        config_id: Some(job.payload.config_id),
        execution_id,
        original_job: job.clone(),
        reason,
        error_message: Some(error_message.to_owned()),
        retry_count: job.attempts as i32,
        created_at: chrono::Utc::now(),
        trace_id: None,
    };

    if let Err(e) = stream.publish(&config.redis_streams_dlq, &entry).await {
        error!(error = %e, job_id = %job.id, "failed to publish dead letter to dlq stream");
    } else {
        warn!(job_id = %job.id, plan_key = %job.payload.plan_key, reason = %reason, "job routed to dead letter queue");
    }
}
