//! End-to-end Plan Executor tests: a real Postgres database (via
//! `orchid-test-utils`), a real Redis instance for the rate limiter/auth
//! cache, and `wiremock` standing in for the upstream HTTP API. Every test
//! step sets `emit_to_kafka: false` so these tests never need a reachable
//! Kafka broker -- `execution::emission::emit` short-circuits before
//! touching the producer, and `build_producer` itself never connects
//! eagerly, so a `FutureProducer` pointed at a bogus address is enough to
//! satisfy `StepDeps`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use orchid_core::auth::AuthManager;
use orchid_core::execution::emission::{build_producer, Emitter};
use orchid_core::execution::plan::execute_plan;
use orchid_core::execution::step::StepDeps;
use orchid_core::execution::types::PlanDefinition;
use orchid_core::expressions::template::Templater;
use orchid_core::expressions::ExpressionCache;
use orchid_core::http::HttpRequestor;
use orchid_core::ratelimit::RateLimiter;

use orchid_db::models::{ErrorType, ExecutionStatus};
use orchid_db::queries::{auth_flows, plan_context, plan_executions};
use orchid_test_utils::{create_test_db, drop_test_db, redis_connection};

fn plan_from(v: serde_json::Value) -> PlanDefinition {
    serde_json::from_value(v).expect("valid plan definition")
}

async fn step_deps(pool: sqlx::PgPool) -> StepDeps {
    let redis_conn = redis_connection().await;
    let templater = Templater::new(ExpressionCache::new());
    let rate_limiter = RateLimiter::new(redis_conn.clone());
    let http = HttpRequestor::new(reqwest::Client::new());
    let auth = AuthManager::new(pool.clone(), redis_conn);
    // Never dialed: every step in this file sets `emit_to_kafka: false`.
    let producer = build_producer("127.0.0.1:9").expect("client config should build without connecting");
    let emitter = Emitter::new(producer, "test-success", "test-error");
    StepDeps { templater, rate_limiter, http, auth, emitter, db: pool }
}

#[tokio::test]
async fn single_get_success_records_context_and_completes() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}, {"id": 2}])))
        .mount(&server)
        .await;

    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": "{{config.base_url}}/users",
            "set_context": {"user_count": "length(response.body)"},
            "emit_to_kafka": false,
        }
    }));

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    let outcome = execute_plan(
        &plan,
        tenant_id,
        "test_integration",
        "sync_users",
        config_id,
        serde_json::json!({"base_url": server.uri()}),
        None,
        &[],
        &deps,
        &cancel,
    )
    .await
    .expect("execute_plan should not hit a DB outage");

    assert!(outcome.result.is_ok(), "root step should have succeeded: {:?}", outcome.result);

    let execution = plan_executions::get_execution(&pool, outcome.execution_id)
        .await
        .expect("get_execution should succeed")
        .expect("execution row should exist");
    assert_eq!(execution.status, ExecutionStatus::Success);

    let context = plan_context::get_context(&pool, tenant_id, "sync_users", config_id)
        .await
        .expect("get_context should succeed");
    assert_eq!(context.get("user_count"), Some(&serde_json::json!(2)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retries_on_503_then_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    // Two failures, then success: each mock is consumed in order of
    // registration and `up_to_n_times` removes itself from the matching
    // pool once exhausted, so the unconditional 200 mock only ever serves
    // the third and later attempts.
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .with_priority(2)
        .mount(&server)
        .await;

    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": format!("{}/flaky", server.uri()),
            "retry": {"max_retries": 3, "backoff": "fibonacci", "initial_delay_ms": 1, "max_delay_ms": 10},
            "emit_to_kafka": false,
        }
    }));

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    let outcome = execute_plan(
        &plan,
        tenant_id,
        "test_integration",
        "flaky_plan",
        config_id,
        serde_json::Value::Null,
        None,
        &[],
        &deps,
        &cancel,
    )
    .await
    .expect("execute_plan should not hit a DB outage");

    assert!(outcome.result.is_ok(), "should succeed once the retry budget reaches the 200 response: {:?}", outcome.result);

    let execution = plan_executions::get_execution(&pool, outcome.execution_id)
        .await
        .expect("get_execution should succeed")
        .expect("execution row should exist");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.retry_count, 2, "two retries should have been spent before the 200");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn abort_on_status_marks_execution_aborted() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": format!("{}/boom", server.uri()),
            "abort_on": [500],
            "emit_to_kafka": false,
        }
    }));

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    let outcome = execute_plan(
        &plan,
        tenant_id,
        "test_integration",
        "abort_plan",
        config_id,
        serde_json::Value::Null,
        None,
        &[],
        &deps,
        &cancel,
    )
    .await
    .expect("execute_plan should not hit a DB outage");

    assert!(outcome.result.is_err());

    let execution = plan_executions::get_execution(&pool, outcome.execution_id)
        .await
        .expect("get_execution should succeed")
        .expect("execution row should exist");
    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(execution.error_type, Some(ErrorType::Permanent));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fanout_respects_concurrency_cap() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ids"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ids": [1, 2, 3, 4]})))
        .mount(&server)
        .await;
    // Each item call takes ~100ms. With `concurrency: 2` over 4 items the
    // fanout needs two rounds (~200ms); unbounded concurrency would finish
    // in one round (~100ms). The wall-clock floor below is the only
    // observable signal of the cap from outside `execution::plan` -- the
    // Semaphore it wraps is private to that module.
    Mock::given(method("GET"))
        .and(path_regex(r"^/items/\d+$"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": format!("{}/ids", server.uri()),
            "iterate_over": "response.body.ids",
            "concurrency": 2,
            "emit_to_kafka": false,
            "sub_steps": [{
                "url": format!("{}/items/{{{{item}}}}", server.uri()),
                "emit_to_kafka": false,
            }],
        }
    }));

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    let started = std::time::Instant::now();
    let outcome = execute_plan(
        &plan,
        tenant_id,
        "test_integration",
        "fanout_plan",
        config_id,
        serde_json::Value::Null,
        None,
        &[],
        &deps,
        &cancel,
    )
    .await
    .expect("execute_plan should not hit a DB outage");
    let elapsed = started.elapsed();

    assert!(outcome.result.is_ok(), "every item succeeds, so the fanout should not fail the parent: {:?}", outcome.result);
    assert!(
        elapsed >= Duration::from_millis(150),
        "4 items at concurrency 2 should take at least two ~100ms rounds, took {elapsed:?}"
    );

    let requests = server.received_requests().await.expect("request recording should be enabled");
    let item_requests = requests.iter().filter(|r| r.url.path().starts_with("/items/")).count();
    assert_eq!(item_requests, 4);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn deadline_exceeded_marks_aborted_with_timeout_error_type() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(3000)))
        .mount(&server)
        .await;

    // `step.timeout_seconds` is generous; the plan's own
    // `max_execution_seconds` is what actually bounds the call, per
    // §4.H's `min(remaining_deadline, step.timeout_seconds)`.
    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": format!("{}/slow", server.uri()),
            "timeout_seconds": 10,
            "emit_to_kafka": false,
        },
        "max_execution_seconds": 1,
    }));

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();
    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    let outcome = execute_plan(
        &plan,
        tenant_id,
        "test_integration",
        "slow_plan",
        config_id,
        serde_json::Value::Null,
        None,
        &[],
        &deps,
        &cancel,
    )
    .await
    .expect("execute_plan should not hit a DB outage");

    assert!(outcome.result.is_err());

    let execution = plan_executions::get_execution(&pool, outcome.execution_id)
        .await
        .expect("get_execution should succeed")
        .expect("execution row should exist");
    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(execution.error_type, Some(ErrorType::Timeout));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn auth_token_is_cached_across_executions_until_expiry() {
    let (pool, db_name) = create_test_db().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "tok-1", "expires_in": 3600})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let tenant_id = Uuid::new_v4();
    let config_id = Uuid::new_v4();

    let auth_plan = serde_json::json!({"root_step": {"url": format!("{}/token", server.uri())}});
    let flow = auth_flows::insert_auth_flow(
        &pool,
        tenant_id,
        "token_flow",
        auth_plan,
        "response.body.access_token",
        "Authorization",
        Some("Bearer {token}"),
        None,
        Some("response.body.expires_in"),
        None,
        60,
    )
    .await
    .expect("insert_auth_flow should succeed");

    let plan = plan_from(serde_json::json!({
        "root_step": {
            "url": format!("{}/resource", server.uri()),
            "auth_flow_id": flow.id,
            "emit_to_kafka": false,
        }
    }));

    let deps = step_deps(pool.clone()).await;
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let outcome = execute_plan(
            &plan,
            tenant_id,
            "test_integration",
            "resource_plan",
            config_id,
            serde_json::Value::Null,
            None,
            &[],
            &deps,
            &cancel,
        )
        .await
        .expect("execute_plan should not hit a DB outage");
        assert!(outcome.result.is_ok(), "authenticated request should succeed: {:?}", outcome.result);
    }

    let requests = server.received_requests().await.expect("request recording should be enabled");
    let token_calls = requests.iter().filter(|r| r.url.path() == "/token").count();
    let resource_calls = requests.iter().filter(|r| r.url.path() == "/resource").count();
    assert_eq!(token_calls, 1, "the second execution should reuse the cached token");
    assert_eq!(resource_calls, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}
