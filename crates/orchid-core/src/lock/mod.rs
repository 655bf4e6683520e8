//! Redis-backed distributed lock: `SET key token NX PX ttl` acquire, a
//! compare-token Lua script for release/extend, and exponential-backoff
//! `try_acquire`.
//!
//! Used by the Scheduler to deduplicate scheduling of the same (plan,
//! config) pair, and available to any component needing
//! single-writer semantics over a key.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out waiting to acquire lock {0:?}")]
    Timeout(String),
    #[error("cancelled while waiting to acquire lock {0:?}")]
    Cancelled(String),
}

/// A held lock lease. Carries the random token used to guard
/// release/extend against releasing a lease some other holder now owns
/// (e.g. after this holder's TTL expired and someone else acquired it).
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct DistributedLock {
    conn: ConnectionManager,
}

impl DistributedLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Attempt to acquire `key` once, non-blocking. Returns `None` if
    /// already held by someone else.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();

        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();

        if acquired {
            Ok(Some(LockHandle {
                key: key.to_owned(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry [`Self::acquire`] with exponential backoff (10ms doubling,
    /// capped at 500ms) until `timeout` elapses or `cancel` fires.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(handle) = self.acquire(key, ttl).await? {
                return Ok(handle);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout(key.to_owned()));
            }

            let sleep_for = backoff.min(MAX_BACKOFF).min(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(LockError::Cancelled(key.to_owned())),
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release a lock, only if `handle.token` still matches the stored
    /// value. A no-op (returns `Ok(false)`) if the lease already expired
    /// and was taken by someone else -- never deletes another holder's
    /// lock.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    /// Extend a held lock's TTL, only if still owned by `handle.token`.
    pub async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(&handle.key)
            .arg(&handle.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = INITIAL_BACKOFF;
        let mut sequence = vec![backoff];
        for _ in 0..10 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
            sequence.push(backoff);
        }
        assert_eq!(sequence[0], Duration::from_millis(10));
        assert_eq!(sequence[1], Duration::from_millis(20));
        assert_eq!(sequence[2], Duration::from_millis(40));
        assert!(sequence.iter().all(|d| *d <= MAX_BACKOFF));
        assert_eq!(*sequence.last().unwrap(), MAX_BACKOFF);
    }

    #[test]
    fn lock_handle_carries_key_and_token() {
        let handle = LockHandle {
            key: "scheduler:plan:k:c".into(),
            token: "abc".into(),
        };
        assert_eq!(handle.key, "scheduler:plan:k:c");
        assert_eq!(handle.token, "abc");
    }
}
