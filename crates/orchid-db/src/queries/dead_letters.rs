//! Database query functions for the `dead_letters` table.
//!
//! This table is a durable mirror of the Redis DLQ stream, written by the
//! Processor so entries survive stream trimming.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DeadLetter, DlqReason};

/// Insert a dead letter row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_dead_letter(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: Option<&str>,
    config_id: Option<Uuid>,
    execution_id: Option<Uuid>,
    original_job: serde_json::Value,
    reason: DlqReason,
    error_message: Option<&str>,
    retry_count: i32,
    trace_id: Option<&str>,
) -> Result<DeadLetter> {
    let entry = sqlx::query_as::<_, DeadLetter>(
        "INSERT INTO dead_letters \
             (tenant_id, plan_key, config_id, execution_id, original_job, \
              reason, error_message, retry_count, trace_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .bind(execution_id)
    .bind(original_job)
    .bind(reason)
    .bind(error_message)
    .bind(retry_count)
    .bind(trace_id)
    .fetch_one(pool)
    .await
    .context("failed to insert dead letter")?;

    Ok(entry)
}

/// List dead letters for a tenant, most recent first.
pub async fn list_dead_letters(pool: &PgPool, tenant_id: Uuid, limit: i64) -> Result<Vec<DeadLetter>> {
    let entries = sqlx::query_as::<_, DeadLetter>(
        "SELECT * FROM dead_letters WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters")?;

    Ok(entries)
}

/// Fetch a single dead letter by ID, for replay.
pub async fn get_dead_letter(pool: &PgPool, id: Uuid) -> Result<Option<DeadLetter>> {
    let entry = sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letters WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dead letter")?;

    Ok(entry)
}

/// Delete a dead letter after a successful replay.
pub async fn delete_dead_letter(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM dead_letters WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete dead letter")?;

    Ok(())
}
