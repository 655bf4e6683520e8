//! Database query functions for the `plan_statistics` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::PlanStatistics;

/// Record the outcome of an execution, upserting the rolling statistics
/// row for its `(plan, config)` pair. `duration_ms` feeds a running
/// average; `success` selects which counter and last-* timestamp to bump.
pub async fn record_outcome(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    config_id: Uuid,
    success: bool,
    duration_ms: f64,
) -> Result<()> {
    let (success_inc, failure_inc) = if success { (1, 0) } else { (0, 1) };

    sqlx::query(
        "INSERT INTO plan_statistics \
             (tenant_id, plan_key, config_id, last_execution_at, last_success_at, \
              last_failure_at, success_count, failure_count, avg_duration_ms) \
         VALUES ($1, $2, $3, NOW(), \
                 CASE WHEN $4 THEN NOW() ELSE NULL END, \
                 CASE WHEN $4 THEN NULL ELSE NOW() END, \
                 $5, $6, $7) \
         ON CONFLICT (tenant_id, plan_key, config_id) DO UPDATE SET \
             last_execution_at = EXCLUDED.last_execution_at, \
             last_success_at = COALESCE(EXCLUDED.last_success_at, plan_statistics.last_success_at), \
             last_failure_at = COALESCE(EXCLUDED.last_failure_at, plan_statistics.last_failure_at), \
             success_count = plan_statistics.success_count + $5, \
             failure_count = plan_statistics.failure_count + $6, \
             avg_duration_ms = (plan_statistics.avg_duration_ms * \
                 (plan_statistics.success_count + plan_statistics.failure_count) + $7) \
                 / (plan_statistics.success_count + plan_statistics.failure_count + 1)",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .bind(success)
    .bind(success_inc)
    .bind(failure_inc)
    .bind(duration_ms)
    .execute(pool)
    .await
    .context("failed to record plan execution outcome")?;

    Ok(())
}

/// Fetch the statistics row for a `(plan, config)` pair, if any executions
/// have been recorded.
pub async fn get_statistics(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    config_id: Uuid,
) -> Result<Option<PlanStatistics>> {
    let stats = sqlx::query_as::<_, PlanStatistics>(
        "SELECT * FROM plan_statistics \
         WHERE tenant_id = $1 AND plan_key = $2 AND config_id = $3",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch plan statistics")?;

    Ok(stats)
}
