//! Database query functions for the `plan_context` table.
//!
//! `set_context` writes are per-key upserts rather than a read-modify-write
//! of a single jsonb blob, so two concurrent executions of the same
//! `(plan, config)` never lose an update to unrelated keys. Last writer
//! wins within a single key -- see `DESIGN.md` for why no CRDT merge is
//! used.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::PlanContextEntry;

/// Upsert a single context key.
pub async fn set_context_key(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    config_id: Uuid,
    key: &str,
    value: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO plan_context (tenant_id, plan_key, config_id, key, value, updated_at) \
         VALUES ($1, $2, $3, $4, $5, NOW()) \
         ON CONFLICT (tenant_id, plan_key, config_id, key) \
         DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("failed to upsert plan context key")?;

    Ok(())
}

/// Load the full context bag for a `(plan, config)` pair as a map.
pub async fn get_context(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    config_id: Uuid,
) -> Result<HashMap<String, serde_json::Value>> {
    let rows = sqlx::query_as::<_, PlanContextEntry>(
        "SELECT * FROM plan_context WHERE tenant_id = $1 AND plan_key = $2 AND config_id = $3",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .fetch_all(pool)
    .await
    .context("failed to load plan context")?;

    Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
}
