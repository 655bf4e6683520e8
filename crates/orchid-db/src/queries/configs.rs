//! Database query functions for the `configs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Config;

/// Insert a new config row.
pub async fn insert_config(
    pool: &PgPool,
    tenant_id: Uuid,
    integration_id: Uuid,
    name: &str,
    values: serde_json::Value,
) -> Result<Config> {
    let config = sqlx::query_as::<_, Config>(
        "INSERT INTO configs (tenant_id, integration_id, name, values) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(integration_id)
    .bind(name)
    .bind(values)
    .fetch_one(pool)
    .await
    .context("failed to insert config")?;

    Ok(config)
}

/// Fetch a config by ID.
pub async fn get_config(pool: &PgPool, id: Uuid) -> Result<Option<Config>> {
    let config = sqlx::query_as::<_, Config>("SELECT * FROM configs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch config")?;

    Ok(config)
}

/// List all enabled configs for an integration.
pub async fn list_enabled_configs(pool: &PgPool, integration_id: Uuid) -> Result<Vec<Config>> {
    let configs = sqlx::query_as::<_, Config>(
        "SELECT * FROM configs WHERE integration_id = $1 AND enabled ORDER BY created_at ASC",
    )
    .bind(integration_id)
    .fetch_all(pool)
    .await
    .context("failed to list enabled configs")?;

    Ok(configs)
}
