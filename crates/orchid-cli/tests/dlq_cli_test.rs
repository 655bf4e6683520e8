//! Integration tests for dead-letter queue handling, exercised against a
//! real PostgreSQL instance.

use serde_json::json;
use uuid::Uuid;

use orchid_db::models::DlqReason;
use orchid_db::queries::dead_letters;
use orchid_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn insert_and_list_dead_letters_most_recent_first() {
    let (pool, db_name) = create_test_db().await;

    let tenant_id = Uuid::new_v4();

    dead_letters::insert_dead_letter(
        &pool,
        tenant_id,
        Some("sync_customers"),
        None,
        None,
        json!({"id": "job-1"}),
        DlqReason::PlanNotFound,
        Some("plan sync_customers not found"),
        0,
        None,
    )
    .await
    .expect("insert_dead_letter should succeed");

    dead_letters::insert_dead_letter(
        &pool,
        tenant_id,
        Some("sync_orders"),
        None,
        None,
        json!({"id": "job-2"}),
        DlqReason::MaxRetriesExceeded,
        Some("exhausted retries"),
        5,
        None,
    )
    .await
    .expect("insert_dead_letter should succeed");

    let entries = dead_letters::list_dead_letters(&pool, tenant_id, 10).await.expect("list_dead_letters should succeed");

    assert_eq!(entries.len(), 2);
    // Most recent first: sync_orders was inserted second.
    assert_eq!(entries[0].plan_key.as_deref(), Some("sync_orders"));
    assert_eq!(entries[0].reason, DlqReason::MaxRetriesExceeded);
    assert_eq!(entries[1].plan_key.as_deref(), Some("sync_customers"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_dead_letters_is_scoped_to_tenant() {
    let (pool, db_name) = create_test_db().await;

    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();

    dead_letters::insert_dead_letter(&pool, tenant_a, Some("plan_a"), None, None, json!({}), DlqReason::ConfigError, None, 0, None)
        .await
        .expect("insert for tenant_a should succeed");

    let entries_b = dead_letters::list_dead_letters(&pool, tenant_b, 10).await.expect("list_dead_letters should succeed");
    assert!(entries_b.is_empty(), "tenant_b should see no dead letters belonging to tenant_a");

    let entries_a = dead_letters::list_dead_letters(&pool, tenant_a, 10).await.expect("list_dead_letters should succeed");
    assert_eq!(entries_a.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_and_delete_dead_letter_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let tenant_id = Uuid::new_v4();
    let inserted = dead_letters::insert_dead_letter(
        &pool,
        tenant_id,
        Some("sync_customers"),
        None,
        None,
        json!({"id": "job-1"}),
        DlqReason::AuthError,
        Some("401 after retry"),
        1,
        Some("trace-123"),
    )
    .await
    .expect("insert_dead_letter should succeed");

    let fetched = dead_letters::get_dead_letter(&pool, inserted.id).await.expect("get_dead_letter should succeed");
    assert!(fetched.is_some());
    assert_eq!(fetched.unwrap().trace_id.as_deref(), Some("trace-123"));

    dead_letters::delete_dead_letter(&pool, inserted.id).await.expect("delete_dead_letter should succeed");

    let after_delete = dead_letters::get_dead_letter(&pool, inserted.id).await.expect("get_dead_letter should succeed");
    assert!(after_delete.is_none(), "dead letter should be gone after delete (simulates a replayed job)");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_dead_letter_missing_id_returns_none() {
    let (pool, db_name) = create_test_db().await;

    let result = dead_letters::get_dead_letter(&pool, Uuid::new_v4()).await.expect("get_dead_letter should succeed");
    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
