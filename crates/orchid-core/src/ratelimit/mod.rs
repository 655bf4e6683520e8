//! Sliding-window rate limiter, dynamic block, and concurrency cap.
//!
//! Backed by Redis (`redis::aio::ConnectionManager`), matching
//! `integration-gateway::rate_limiter::RedisRateLimiter`'s shape of a
//! thin struct wrapping one pooled connection manager. The admission
//! decision is computed by a single Lua script (`EVAL`) so the
//! evict-count-admit sequence is atomic across concurrent callers sharing
//! the same bucket, cluster-wide -- this is why `max_concurrent` uses a
//! Redis-backed counter rather than the in-process `tokio::sync::Semaphore`
//! the Plan Executor uses for fanout concurrency (see `execution::plan`):
//! rate-limit buckets are shared across every worker process, fanout
//! concurrency is confined to a single execution.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

/// How a named rate-limit bucket's key is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    PerConfig,
    PerEndpoint,
}

/// Which response headers feed dynamic rate-limit updates (
/// §4.G point 6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicHeaders {
    pub remaining_header: Option<String>,
    pub reset_header: Option<String>,
    pub limit_header: Option<String>,
    pub retry_after_header: Option<String>,
}

/// A named rate-limit policy attached to a plan or step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub name: String,
    pub endpoint_pattern: Option<String>,
    pub requests: u32,
    pub window_secs: u64,
    pub scope: RateLimitScope,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub dynamic: Option<DynamicHeaders>,
}

impl RateLimitConfig {
    /// Compose the bucket key: `name[:config_id][:endpoint]` per scope.
    pub fn bucket_key(&self, config_id: &str, endpoint: &str) -> String {
        match self.scope {
            RateLimitScope::Global => self.name.clone(),
            RateLimitScope::PerConfig => format!("{}:{}", self.name, config_id),
            RateLimitScope::PerEndpoint => format!("{}:{}:{}", self.name, config_id, endpoint),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: i64,
    /// Epoch milliseconds at which the window (or block) clears.
    pub reset_at: i64,
    pub retry_in: Duration,
}

const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window_ms)
    return {1, limit - count - 1, now + window_ms}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset_at = now + window_ms
if oldest[2] ~= nil then
    reset_at = tonumber(oldest[2]) + window_ms
end
return {0, 0, reset_at}
"#;

const RELEASE_CONCURRENCY_SCRIPT: &str = r#"
local key = KEYS[1]
local current = redis.call('DECR', key)
if current < 0 then
    redis.call('SET', key, 0)
end
return current
"#;

/// Sliding-window + dynamic-block + concurrency-cap rate limiter shared by
/// every Step Executor invocation in this process.
#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Check admission for `bucket_key` under `limit` over `window`. Fails
    /// closed (returns `allowed=false`) while a dynamic block is active for
    /// the same bucket.
    pub async fn allow(
        &self,
        bucket_key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<AdmissionDecision, RateLimitError> {
        let mut conn = self.conn.clone();

        let block_key = block_key(bucket_key);
        let block_ttl_ms: i64 = conn.pttl(&block_key).await.unwrap_or(-2);
        if block_ttl_ms > 0 {
            return Ok(AdmissionDecision {
                allowed: false,
                remaining: 0,
                reset_at: now_ms() + block_ttl_ms,
                retry_in: Duration::from_millis(block_ttl_ms as u64),
            });
        }

        let now = now_ms();
        let window_ms = window.as_millis() as i64;
        let member = format!("{now}-{}", rand::random::<u32>());

        let (allowed, remaining, reset_at): (i64, i64, i64) = redis::Script::new(ADMIT_SCRIPT)
            .key(storage_key(bucket_key))
            .arg(now)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let retry_in = if allowed == 1 {
            Duration::ZERO
        } else {
            Duration::from_millis((reset_at - now).max(0) as u64)
        };

        Ok(AdmissionDecision {
            allowed: allowed == 1,
            remaining,
            reset_at,
            retry_in,
        })
    }

    /// Set a dynamic block on `bucket_key` for `duration`, honoring
    /// `Retry-After` or a dynamic-header extraction policy.
    pub async fn block_for(&self, bucket_key: &str, duration: Duration) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        let key = block_key(bucket_key);
        let _: () = conn
            .set_ex(&key, 1u8, duration.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// Acquire one slot of a Redis-backed counting semaphore for
    /// `max_concurrent`. Returns `false` if the cap is already saturated;
    /// callers must call [`Self::release_concurrency`] exactly once for
    /// every successful acquisition, on every exit path.
    pub async fn acquire_concurrency(
        &self,
        bucket_key: &str,
        max_concurrent: u32,
        held_ttl: Duration,
    ) -> Result<bool, RateLimitError> {
        let mut conn = self.conn.clone();
        let key = concurrency_key(bucket_key);
        let current: i64 = conn.incr(&key, 1).await?;
        let _: () = conn.expire(&key, held_ttl.as_secs().max(1) as i64).await?;

        if current > max_concurrent as i64 {
            self.release_concurrency(bucket_key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Release a previously acquired concurrency slot. Idempotent floor at
    /// zero so a double release (e.g. panic-recovery path plus normal
    /// completion) never goes negative.
    pub async fn release_concurrency(&self, bucket_key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        let key = concurrency_key(bucket_key);
        let _: i64 = redis::Script::new(RELEASE_CONCURRENCY_SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// The sorted-set key holding arrival timestamps for `bucket_key`, per
/// the `ratelimit:{bucket_key}` key namespace.
fn storage_key(bucket_key: &str) -> String {
    format!("ratelimit:{bucket_key}")
}

fn block_key(bucket_key: &str) -> String {
    format!("ratelimit:{bucket_key}:block")
}

fn concurrency_key(bucket_key: &str) -> String {
    format!("ratelimit:{bucket_key}:concurrency")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_composition_by_scope() {
        let mut cfg = RateLimitConfig {
            name: "default".into(),
            endpoint_pattern: None,
            requests: 10,
            window_secs: 60,
            scope: RateLimitScope::Global,
            priority: 0,
            max_concurrent: 0,
            dynamic: None,
        };
        assert_eq!(cfg.bucket_key("cfg1", "/users"), "default");

        cfg.scope = RateLimitScope::PerConfig;
        assert_eq!(cfg.bucket_key("cfg1", "/users"), "default:cfg1");

        cfg.scope = RateLimitScope::PerEndpoint;
        assert_eq!(cfg.bucket_key("cfg1", "/users"), "default:cfg1:/users");
    }

    #[test]
    fn key_naming_matches_external_interfaces() {
        assert_eq!(storage_key("default:cfg1"), "ratelimit:default:cfg1");
        assert_eq!(block_key("default:cfg1"), "ratelimit:default:cfg1:block");
        assert_eq!(
            concurrency_key("default:cfg1"),
            "ratelimit:default:cfg1:concurrency"
        );
    }
}
