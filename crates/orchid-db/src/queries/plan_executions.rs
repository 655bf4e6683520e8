//! Database query functions for the `plan_executions` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ErrorType, ExecutionStatus, PlanExecution};

/// Create a new execution row in `pending` status.
pub async fn insert_pending_execution(
    pool: &PgPool,
    tenant_id: Uuid,
    plan_key: &str,
    config_id: Uuid,
    parent_execution_id: Option<Uuid>,
    step_path: &str,
) -> Result<PlanExecution> {
    let execution = sqlx::query_as::<_, PlanExecution>(
        "INSERT INTO plan_executions \
             (tenant_id, plan_key, config_id, parent_execution_id, status, step_path) \
         VALUES ($1, $2, $3, $4, 'pending', $5) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(plan_key)
    .bind(config_id)
    .bind(parent_execution_id)
    .bind(step_path)
    .fetch_one(pool)
    .await
    .context("failed to insert plan execution")?;

    Ok(execution)
}

/// Atomically transition an execution from `pending` to `running`.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = 'pending'`, so the row is only updated if it has not already
/// moved. Returns the number of rows affected.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_executions SET status = 'running' WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution running")?;

    Ok(result.rows_affected())
}

/// Record the outcome of one HTTP call against an execution row, without
/// changing its status.
#[allow(clippy::too_many_arguments)]
pub async fn record_request(
    pool: &PgPool,
    id: Uuid,
    request_url: &str,
    request_method: &str,
    response_status_code: Option<i32>,
    response_size_bytes: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE plan_executions \
         SET request_url = $1, request_method = $2, \
             response_status_code = $3, response_size_bytes = $4 \
         WHERE id = $5",
    )
    .bind(request_url)
    .bind(request_method)
    .bind(response_status_code)
    .bind(response_size_bytes)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record execution request")?;

    Ok(())
}

/// Mark an execution terminal (`success`, `failed`, or `aborted`).
///
/// A terminal status is reached exactly once per execution; callers are
/// expected to call this only after the Plan Executor returns.
pub async fn mark_terminal(
    pool: &PgPool,
    id: Uuid,
    status: ExecutionStatus,
    error_message: Option<&str>,
    error_type: Option<ErrorType>,
    retry_count: i32,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE plan_executions \
         SET status = $1, completed_at = NOW(), error_message = $2, \
             error_type = $3, retry_count = $4 \
         WHERE id = $5",
    )
    .bind(status)
    .bind(error_message)
    .bind(error_type)
    .bind(retry_count)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution terminal")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("plan execution {id} not found");
    }

    Ok(())
}

/// Fetch an execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<PlanExecution>> {
    let execution = sqlx::query_as::<_, PlanExecution>("SELECT * FROM plan_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan execution")?;

    Ok(execution)
}

/// List the fanout children of a parent execution.
pub async fn list_children(pool: &PgPool, parent_execution_id: Uuid) -> Result<Vec<PlanExecution>> {
    let children = sqlx::query_as::<_, PlanExecution>(
        "SELECT * FROM plan_executions WHERE parent_execution_id = $1 ORDER BY started_at ASC",
    )
    .bind(parent_execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution children")?;

    Ok(children)
}
