//! Redis Streams job queue: publish / consumer-group read / ack /
//! pending / claim, plus the `JobMessage`/`DLQEntry` wire types.
//!
//! Grounded directly on the corpus's `stream-worker` file: its
//! `StreamJob`/`StreamProcessor` traits, `XADD`/`XACK` command
//! construction, and claim-idle recovery loop are reused here, generalized
//! from a single job type to the `JobMessage` envelope this engine needs.

pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use types::{DlqJobEntry, JobMessage, PlanExecutionPayload};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to (de)serialize stream entry: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stream entry missing `data` field")]
    MissingData,
}

/// One delivered stream entry: its message id plus the deserialized
/// payload.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub id: String,
    pub payload: T,
}

/// One idle-but-unacked entry reported by `pending`.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: i64,
}

/// Thin wrapper over a Redis stream + consumer group, generic over the
/// JSON-serializable job payload type.
#[derive(Clone)]
pub struct JobStream {
    conn: ConnectionManager,
}

impl JobStream {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Publish `job` (stamping `id`/`created_at` if unset by the caller)
    /// and return the Redis-assigned message id.
    pub async fn publish<T: Serialize>(&self, stream: &str, job: &T) -> Result<String, StreamError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        let id: String = conn
            .xadd(stream, "*", &[("data", payload.as_str())])
            .await?;
        Ok(id)
    }

    /// Idempotently create `group` on `stream`, creating the stream itself
    /// if it does not yet exist (`MKSTREAM`).
    pub async fn create_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `count` undelivered messages for `consumer` in `group`,
    /// blocking up to `block` when the stream is empty.
    pub async fn consume<T: DeserializeOwned>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery<T>>, StreamError> {
        let mut conn = self.conn.clone();

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(
                &[stream],
                &[">"],
                &redis::streams::StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count)
                    .block(block.as_millis() as usize),
            )
            .await?;

        decode_stream_reply(reply)
    }

    /// Acknowledge one or more delivered message ids.
    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), StreamError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, ids).await?;
        Ok(())
    }

    /// Enumerate up to `count` owned-but-unacked messages, with idle time.
    pub async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle: Duration::from_millis(entry.time_since_delivered as u64),
                delivery_count: entry.times_delivered,
            })
            .collect())
    }

    /// Steal messages idle longer than `min_idle`, re-assigning them to
    /// `consumer`. Used by worker recovery when a consumer has crashed.
    pub async fn claim<T: DeserializeOwned>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<Delivery<T>>, StreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as usize);
        for id in ids {
            cmd.arg(id);
        }

        let reply: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        reply
            .ids
            .into_iter()
            .map(|entry| decode_entry(entry.id, &entry.map))
            .collect()
    }
}

fn decode_stream_reply<T: DeserializeOwned>(
    reply: redis::streams::StreamReadReply,
) -> Result<Vec<Delivery<T>>, StreamError> {
    let mut out = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            out.push(decode_entry(entry.id, &entry.map)?);
        }
    }
    Ok(out)
}

fn decode_entry<T: DeserializeOwned>(
    id: String,
    map: &HashMap<String, redis::Value>,
) -> Result<Delivery<T>, StreamError> {
    let data = map.get("data").ok_or(StreamError::MissingData)?;
    let raw: String = redis::from_redis_value(data)?;
    let payload = serde_json::from_str(&raw)?;
    Ok(Delivery { id, payload })
}

/// Convenience wrapper to timestamp a newly constructed job in-process,
/// used by the Scheduler before publish.
pub fn stamp_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_entry_parses_json_payload() {
        let mut map = HashMap::new();
        map.insert(
            "data".to_string(),
            redis::Value::BulkString(json!({"a": 1}).to_string().into_bytes()),
        );
        let delivery: Delivery<serde_json::Value> =
            decode_entry("1-0".to_string(), &map).unwrap();
        assert_eq!(delivery.id, "1-0");
        assert_eq!(delivery.payload, json!({"a": 1}));
    }

    #[test]
    fn decode_entry_missing_data_errors() {
        let map = HashMap::new();
        let result: Result<Delivery<serde_json::Value>, StreamError> =
            decode_entry("1-0".to_string(), &map);
        assert!(matches!(result, Err(StreamError::MissingData)));
    }
}
