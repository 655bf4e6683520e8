//! Auth Manager: executes an auth flow's token-acquisition subplan, caches
//! the resulting token in Redis, and injects it into request headers.
//!
//! The cache entry lives at `auth:token:{tenant}:{auth_flow_id}:{config_id}`,
//! read/written through the same `redis::aio::ConnectionManager` the rate
//! limiter and lock share -- one pooled connection manager, process-wide.
//! Acquiring a fresh token reuses the Step Executor directly (the auth
//! subplan's root step is "just a step"), so no separate HTTP path exists
//! for auth.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::execution::step::{self, StepDeps, StepError};
use crate::execution::types::PlanDefinition;
use crate::execution::ExecutionContext;
use crate::expressions::ExprError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth flow {0} not found")]
    AuthFlowNotFound(Uuid),
    #[error("auth flow {0} has an unparseable plan definition: {1}")]
    InvalidPlanDefinition(Uuid, serde_json::Error),
    #[error("token extraction failed at path `{0}`")]
    TokenExtractionFailed(String),
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),
    #[error("auth subplan step failed: {0}")]
    Step(Box<StepError>),
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to (de)serialize cached token: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StepError> for AuthError {
    fn from(e: StepError) -> Self {
        AuthError::Step(Box::new(e))
    }
}

/// A cached (or freshly acquired) token plus the header(s) it should be
/// injected as, exposed to expressions as `auth.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub token: String,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    /// Zero means "never expires".
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl AuthContext {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "token": self.token,
            "token_type": self.token_type,
            "refresh_token": self.refresh_token,
            "expires_at": self.expires_at,
            "headers": self.headers,
            "created_at": self.created_at,
        })
    }

    /// `IsExpired(skew) ⇔ expires_at ≠ 0 ∧ now ≥ expires_at − skew`.
    fn is_expired(&self, skew: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => {
                let skewed = expires_at - chrono::Duration::from_std(skew).unwrap_or_default();
                Utc::now() >= skewed
            }
        }
    }
}

#[derive(Clone)]
pub struct AuthManager {
    pool: PgPool,
    redis: ConnectionManager,
}

impl AuthManager {
    pub fn new(pool: PgPool, redis: ConnectionManager) -> Self {
        Self { pool, redis }
    }

    fn cache_key(tenant_id: Uuid, auth_flow_id: Uuid, config_id: Uuid) -> String {
        format!("auth:token:{tenant_id}:{auth_flow_id}:{config_id}")
    }

    /// Resolve a usable `AuthContext` for `auth_flow_id`, using the cache
    /// when possible and otherwise running the auth subplan.
    pub async fn get_auth_context(
        &self,
        auth_flow_id: Uuid,
        tenant_id: Uuid,
        config_id: Uuid,
        config_values: Value,
        step_deps: &StepDeps,
        cancel: &CancellationToken,
    ) -> Result<AuthContext, AuthError> {
        let flow = orchid_db::queries::auth_flows::get_auth_flow(&self.pool, auth_flow_id)
            .await?
            .ok_or(AuthError::AuthFlowNotFound(auth_flow_id))?;

        let key = Self::cache_key(tenant_id, auth_flow_id, config_id);
        let mut conn = self.redis.clone();

        if let Some(raw) = conn.get::<_, Option<String>>(&key).await? {
            let mut cached: AuthContext = serde_json::from_str(&raw)?;
            if !cached.is_expired(Duration::from_secs(flow.skew_seconds.max(0) as u64)) {
                // Migrate-in-place: older cache entries may predate a header
                // rename on the auth flow; never drop the header the flow
                // currently wants injected.
                cached
                    .headers
                    .entry(flow.header_name.clone())
                    .or_insert_with(|| cached.token.clone());
                return Ok(cached);
            }
        }

        let plan: PlanDefinition = serde_json::from_str(&flow.plan_definition.to_string())
            .map_err(|e| AuthError::InvalidPlanDefinition(auth_flow_id, e))?;

        let mut ctx = ExecutionContext::new(
            flow.name.clone(),
            config_id,
            Uuid::new_v4(),
            config_values,
            HashMap::new(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(plan.max_execution_seconds);
        let outcome = step::execute_step(
            &plan.root_step,
            &mut ctx,
            tenant_id,
            "auth",
            &[],
            step_deps,
            cancel,
            deadline,
        )
        .await?;

        let response = outcome
            .response
            .ok_or_else(|| AuthError::TokenExtractionFailed(flow.token_path.clone()))?;
        let data = serde_json::json!({ "response": response.to_value() });

        let cache = step_deps.templater.cache();
        let token = cache.evaluate(&flow.token_path, &data)?;
        let token = crate::expressions::as_string(&token);
        if token.is_empty() {
            return Err(AuthError::TokenExtractionFailed(flow.token_path.clone()));
        }

        let refresh_token = flow
            .refresh_path
            .as_deref()
            .map(|path| cache.evaluate(path, &data))
            .transpose()?
            .map(|v| crate::expressions::as_string(&v))
            .filter(|s| !s.is_empty());

        let expires_in_secs = flow
            .expires_in_path
            .as_deref()
            .map(|path| cache.evaluate(path, &data))
            .transpose()?
            .map(|v| crate::expressions::as_i64(&v));

        let now = Utc::now();
        let expires_at = expires_in_secs
            .filter(|secs| *secs > 0)
            .map(|secs| now + chrono::Duration::seconds(secs));

        let header_value = render_header_format(flow.header_format.as_deref(), &token);

        let mut headers = HashMap::new();
        headers.insert(flow.header_name.clone(), header_value);

        let auth_ctx = AuthContext {
            token,
            token_type: None,
            refresh_token,
            expires_at,
            headers,
            created_at: now,
        };

        let ttl = if let Some(ttl_seconds) = flow.ttl_seconds {
            Duration::from_secs(ttl_seconds.max(0) as u64)
        } else if let Some(expires_at) = expires_at {
            let remaining = (expires_at - now - chrono::Duration::seconds(flow.skew_seconds as i64))
                .num_seconds();
            if remaining > 0 {
                Duration::from_secs(remaining as u64)
            } else {
                Duration::from_secs(3600)
            }
        } else {
            Duration::from_secs(3600)
        };

        let serialized = serde_json::to_string(&auth_ctx)?;
        let _: () = conn.set_ex(&key, serialized, ttl.as_secs().max(1)).await?;

        Ok(auth_ctx)
    }

    /// Delete a cached token, e.g. after an upstream 401. Idempotent: a
    /// second invalidation for an already-absent key is a no-op.
    pub async fn invalidate(
        &self,
        tenant_id: Uuid,
        auth_flow_id: Uuid,
        config_id: Uuid,
    ) -> Result<(), AuthError> {
        let mut conn = self.redis.clone();
        let key = Self::cache_key(tenant_id, auth_flow_id, config_id);
        let _: () = conn.del(&key).await?;
        Ok(())
    }
}

/// Substitute `{token}` or `{{token}}` in `format` with the raw token. When
/// `format` is absent, the header value is the raw token.
fn render_header_format(format: Option<&str>, token: &str) -> String {
    match format {
        None => token.to_owned(),
        Some(fmt) => fmt.replace("{{token}}", token).replace("{token}", token),
    }
}
