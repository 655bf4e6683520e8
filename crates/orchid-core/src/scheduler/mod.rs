//! Scheduler: polls for `(plan, config)` pairs due to run and publishes a
//! job for each. Dedup across
//! concurrently-running scheduler processes is a non-blocking distributed
//! lock per pair -- only the process that wins the lock publishes, and it
//! releases immediately rather than holding it for the run's duration
//! (the lock is cheap dedup, not a run-lock).
//!
//! Readiness is a single query joining plans, configs, and
//! statistics, generalized from a single queue pop to a batch of due
//! pairs per tick.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::lock::DistributedLock;
use crate::streams::types::{JobMessage, PlanExecutionPayload};
use crate::streams::JobStream;

/// Scheduler dependencies and tick loop.
pub struct Scheduler {
    pool: PgPool,
    lock: DistributedLock,
    stream: JobStream,
    config: Arc<EngineConfig>,
}

impl Scheduler {
    pub fn new(pool: PgPool, lock: DistributedLock, stream: JobStream, config: Arc<EngineConfig>) -> Self {
        Self { pool, lock, stream, config }
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.scheduler_enabled {
            info!("scheduler disabled, exiting");
            return;
        }

        let mut interval = tokio::time::interval(self.config.scheduler_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// One scheduling pass: find due pairs, try to claim each with a
    /// non-blocking dedup lock, and publish a job for every pair claimed.
    async fn tick(&self) -> anyhow::Result<()> {
        let due = orchid_db::queries::plans::get_due_plan_configs(&self.pool, self.config.scheduler_batch_size).await?;
        debug!(count = due.len(), "scheduler tick found due plan/config pairs");

        for pair in due {
            let lock_key = format!("scheduler:lock:{}:{}", pair.plan_key, pair.config_id);
            let Some(handle) = self.lock.acquire(&lock_key, self.config.scheduler_lock_ttl).await? else {
                // Another scheduler process already claimed this pair this tick.
                continue;
            };

            let result = self.publish_job(&pair).await;
            if let Err(e) = self.lock.release(&handle).await {
                warn!(error = %e, lock_key = %lock_key, "failed to release scheduler dedup lock");
            }

            if let Err(e) = result {
                error!(error = %e, plan_key = %pair.plan_key, config_id = %pair.config_id, "failed to publish scheduled job");
            }
        }

        Ok(())
    }

    async fn publish_job(&self, pair: &orchid_db::queries::plans::DuePlanConfig) -> anyhow::Result<()> {
        let plan = orchid_db::queries::plans::get_plan(&self.pool, pair.plan_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("plan {} referenced by due query no longer exists", pair.plan_id))?;

        let integration = orchid_db::queries::integrations::get_integration(&self.pool, pair.tenant_id, plan.integration_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("integration {} no longer exists", plan.integration_id))?;

        let payload = PlanExecutionPayload {
            tenant_id: pair.tenant_id,
            integration: integration.name,
            plan_key: pair.plan_key.clone(),
            config_id: pair.config_id,
            scheduled_at: crate::streams::stamp_now(),
        };
        let job = JobMessage::new_plan_execution(payload);

        self.stream.publish(&self.config.redis_streams_job_queue, &job).await?;
        info!(plan_key = %pair.plan_key, config_id = %pair.config_id, job_id = %job.id, "scheduled job published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_lock_key_is_scoped_to_plan_and_config() {
        let a = format!("scheduler:lock:{}:{}", "sync_customers", uuid::Uuid::nil());
        assert_eq!(a, "scheduler:lock:sync_customers:00000000-0000-0000-0000-000000000000");
    }
}
