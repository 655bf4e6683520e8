//! Database query functions for the `auth_flows` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AuthFlow;

/// Insert a new auth flow row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_auth_flow(
    pool: &PgPool,
    tenant_id: Uuid,
    name: &str,
    plan_definition: serde_json::Value,
    token_path: &str,
    header_name: &str,
    header_format: Option<&str>,
    refresh_path: Option<&str>,
    expires_in_path: Option<&str>,
    ttl_seconds: Option<i64>,
    skew_seconds: i32,
) -> Result<AuthFlow> {
    let flow = sqlx::query_as::<_, AuthFlow>(
        "INSERT INTO auth_flows \
             (tenant_id, name, plan_definition, token_path, header_name, \
              header_format, refresh_path, expires_in_path, ttl_seconds, skew_seconds) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(name)
    .bind(plan_definition)
    .bind(token_path)
    .bind(header_name)
    .bind(header_format)
    .bind(refresh_path)
    .bind(expires_in_path)
    .bind(ttl_seconds)
    .bind(skew_seconds)
    .fetch_one(pool)
    .await
    .context("failed to insert auth flow")?;

    Ok(flow)
}

/// Fetch an auth flow by ID.
pub async fn get_auth_flow(pool: &PgPool, id: Uuid) -> Result<Option<AuthFlow>> {
    let flow = sqlx::query_as::<_, AuthFlow>("SELECT * FROM auth_flows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch auth flow")?;

    Ok(flow)
}
