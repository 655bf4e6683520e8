//! Database query functions for the `integrations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Integration;

/// Insert a new integration row.
pub async fn insert_integration(pool: &PgPool, tenant_id: Uuid, name: &str) -> Result<Integration> {
    let integration = sqlx::query_as::<_, Integration>(
        "INSERT INTO integrations (tenant_id, name) VALUES ($1, $2) RETURNING *",
    )
    .bind(tenant_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert integration")?;

    Ok(integration)
}

/// Fetch an integration by ID, scoped to its tenant.
pub async fn get_integration(pool: &PgPool, tenant_id: Uuid, id: Uuid) -> Result<Option<Integration>> {
    let integration = sqlx::query_as::<_, Integration>(
        "SELECT * FROM integrations WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch integration")?;

    Ok(integration)
}

/// List all integrations for a tenant, ordered by creation time.
pub async fn list_integrations(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Integration>> {
    let integrations = sqlx::query_as::<_, Integration>(
        "SELECT * FROM integrations WHERE tenant_id = $1 ORDER BY created_at ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list integrations")?;

    Ok(integrations)
}
