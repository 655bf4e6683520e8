//! Database query functions for the `plans` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Plan;

/// Insert a new plan row. Returns the inserted plan with server-generated
/// defaults (id, created_at, updated_at).
#[allow(clippy::too_many_arguments)]
pub async fn insert_plan(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    integration_id: Uuid,
    wait_seconds: i32,
    repeat_count: Option<i32>,
    definition: serde_json::Value,
) -> Result<Plan> {
    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (tenant_id, plan_key, integration_id, wait_seconds, repeat_count, definition) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(integration_id)
    .bind(wait_seconds)
    .bind(repeat_count)
    .bind(definition)
    .fetch_one(pool)
    .await
    .context("failed to insert plan")?;

    Ok(plan)
}

/// Fetch a plan by `(tenant_id, plan_key)`.
pub async fn get_plan_by_key(pool: &PgPool, tenant_id: Uuid, plan_key: &str) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE tenant_id = $1 AND plan_key = $2",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch plan")?;

    Ok(plan)
}

/// Fetch a plan by ID.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// List all enabled plans for a tenant, ordered by creation time.
pub async fn list_enabled_plans(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Plan>> {
    let plans = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE tenant_id = $1 AND enabled ORDER BY created_at ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list enabled plans")?;

    Ok(plans)
}

/// Replace a plan's definition and bump `updated_at`.
pub async fn update_plan_definition(
    pool: &PgPool,
    id: Uuid,
    definition: serde_json::Value,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE plans SET definition = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(definition)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update plan definition")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("plan {id} not found");
    }

    Ok(())
}

/// Enable or disable a plan.
pub async fn set_plan_enabled(pool: &PgPool, id: Uuid, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE plans SET enabled = $1 WHERE id = $2")
        .bind(enabled)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update plan enabled flag")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("plan {id} not found");
    }

    Ok(())
}

/// A `(plan, config)` pair that is due for execution: its last run (if any)
/// started more than `wait_seconds` ago.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DuePlanConfig {
    pub tenant_id: Uuid,
    pub plan_key: String,
    pub config_id: Uuid,
    pub plan_id: Uuid,
    pub wait_seconds: i32,
    pub repeat_count: Option<i32>,
}

/// Find `(plan, config)` pairs due for scheduling: enabled plan, enabled
/// config under the same integration, and either never executed or last
/// executed more than `wait_seconds` ago. Ordered oldest-due-first so the
/// scheduler drains the backlog fairly.
///
/// Mirrors `get_ready_tasks`'s `NOT EXISTS`-style readiness predicate,
/// adapted to a time-based `LEFT JOIN ... last_execution_at` check.
pub async fn get_due_plan_configs(pool: &PgPool, batch_size: i64) -> Result<Vec<DuePlanConfig>> {
    let rows = sqlx::query_as::<_, DuePlanConfig>(
        "SELECT p.tenant_id, p.plan_key, c.id AS config_id, p.id AS plan_id, \
                p.wait_seconds, p.repeat_count \
         FROM plans p \
         JOIN configs c ON c.integration_id = p.integration_id AND c.tenant_id = p.tenant_id \
         LEFT JOIN plan_statistics s \
           ON s.tenant_id = p.tenant_id AND s.plan_key = p.plan_key AND s.config_id = c.id \
         WHERE p.enabled AND c.enabled \
           AND (s.last_execution_at IS NULL \
                OR s.last_execution_at < NOW() - (p.wait_seconds || ' seconds')::interval) \
         ORDER BY s.last_execution_at ASC NULLS FIRST \
         LIMIT $1",
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await
    .context("failed to query due plan/config pairs")?;

    Ok(rows)
}
