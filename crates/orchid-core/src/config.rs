//! Environment-sourced configuration for the plan execution engine.
//!
//! Mirrors `orchid-db::config::DbConfig`: every field has a documented
//! default and is read with `env::var(...).unwrap_or_else(...)`, never a
//! panic on a missing variable.

use std::env;
use std::time::Duration;

/// Aggregated engine configuration, built once at process start and
/// shared (via `Arc`) with the Processor, Scheduler, and Step Executor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for a single root plan execution.
    pub max_execution_time: Duration,
    /// Cap on `while`-loop iterations for a single step.
    pub max_loops: u32,
    /// Cap on recursive sub-step nesting.
    pub max_nesting_depth: u32,
    /// Scheduler tick interval.
    pub scheduler_poll_interval: Duration,
    /// Whether the scheduler loop runs at all in this process.
    pub scheduler_enabled: bool,
    /// Scheduler batch size per tick.
    pub scheduler_batch_size: i64,
    /// TTL for a scheduler dedup lock.
    pub scheduler_lock_ttl: Duration,
    /// Redis stream key for the plan-execution job queue.
    pub redis_streams_job_queue: String,
    /// Redis consumer group shared by all workers.
    pub redis_streams_consumer_group: String,
    /// Kafka topic for success-path step responses.
    pub kafka_response_topic: String,
    /// Kafka topic for error/ignore-path step responses.
    pub kafka_error_topic: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Kafka bootstrap servers.
    pub kafka_bootstrap_servers: String,
    /// Consumer name prefix; the actual consumer name appends a unique
    /// suffix so multiple processes in the same group never collide.
    pub processor_consumer_name: String,
    /// Max in-flight job tasks per worker process.
    pub processor_concurrency: usize,
    /// Messages requested per `XREADGROUP` call.
    pub processor_batch_size: usize,
    /// How long a blocking `XREADGROUP` waits for new messages.
    pub processor_block: Duration,
    /// Minimum idle time before a pending message is eligible for
    /// `XCLAIM` recovery.
    pub processor_claim_idle: Duration,
    /// How often the periodic claim task sweeps for abandoned messages.
    pub processor_claim_interval: Duration,
    /// Attempts (including the first) before a job is routed to the DLQ.
    pub max_job_attempts: u32,
    /// Redis stream key for dead-lettered jobs.
    pub redis_streams_dlq: String,
}

impl EngineConfig {
    pub const DEFAULT_MAX_EXECUTION_SECONDS: u64 = 300;
    pub const DEFAULT_MAX_LOOPS: u32 = 1000;
    pub const DEFAULT_MAX_NESTING_DEPTH: u32 = 5;
    pub const DEFAULT_SCHEDULER_POLL_SECONDS: u64 = 30;
    pub const DEFAULT_SCHEDULER_BATCH_SIZE: i64 = 100;
    pub const DEFAULT_SCHEDULER_LOCK_TTL_SECONDS: u64 = 10;
    pub const DEFAULT_JOB_QUEUE: &str = "orchid:jobs";
    pub const DEFAULT_CONSUMER_GROUP: &str = "orchid-workers";
    pub const DEFAULT_RESPONSE_TOPIC: &str = "api-responses";
    pub const DEFAULT_ERROR_TOPIC: &str = "api-errors";
    pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
    pub const DEFAULT_KAFKA_BOOTSTRAP: &str = "localhost:9092";
    pub const DEFAULT_PROCESSOR_CONCURRENCY: usize = 20;
    pub const DEFAULT_PROCESSOR_BATCH_SIZE: usize = 10;
    pub const DEFAULT_PROCESSOR_BLOCK_MS: u64 = 5_000;
    pub const DEFAULT_PROCESSOR_CLAIM_IDLE_SECS: u64 = 30;
    pub const DEFAULT_PROCESSOR_CLAIM_INTERVAL_SECS: u64 = 60;
    pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 5;
    pub const DEFAULT_DLQ_STREAM: &str = "orchid:dlq";

    /// Build a config from the environment, per the documented configuration
    /// surface. Every variable falls back to its documented default.
    pub fn from_env() -> Self {
        Self {
            max_execution_time: Duration::from_secs(env_u64(
                "MAX_EXECUTION_TIME",
                Self::DEFAULT_MAX_EXECUTION_SECONDS,
            )),
            max_loops: env_u32("MAX_LOOPS", Self::DEFAULT_MAX_LOOPS),
            max_nesting_depth: env_u32("MAX_NESTING_DEPTH", Self::DEFAULT_MAX_NESTING_DEPTH),
            scheduler_poll_interval: Duration::from_secs(env_u64(
                "SCHEDULER_POLL_INTERVAL",
                Self::DEFAULT_SCHEDULER_POLL_SECONDS,
            )),
            scheduler_enabled: env::var("SCHEDULER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            scheduler_batch_size: env::var("SCHEDULER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_SCHEDULER_BATCH_SIZE),
            scheduler_lock_ttl: Duration::from_secs(env_u64(
                "SCHEDULER_LOCK_TTL",
                Self::DEFAULT_SCHEDULER_LOCK_TTL_SECONDS,
            )),
            redis_streams_job_queue: env::var("REDIS_STREAMS_JOB_QUEUE")
                .unwrap_or_else(|_| Self::DEFAULT_JOB_QUEUE.to_owned()),
            redis_streams_consumer_group: env::var("REDIS_STREAMS_CONSUMER_GROUP")
                .unwrap_or_else(|_| Self::DEFAULT_CONSUMER_GROUP.to_owned()),
            kafka_response_topic: env::var("KAFKA_RESPONSE_TOPIC")
                .unwrap_or_else(|_| Self::DEFAULT_RESPONSE_TOPIC.to_owned()),
            kafka_error_topic: env::var("KAFKA_ERROR_TOPIC")
                .unwrap_or_else(|_| Self::DEFAULT_ERROR_TOPIC.to_owned()),
            redis_url: env::var("ORCHID_REDIS_URL")
                .unwrap_or_else(|_| Self::DEFAULT_REDIS_URL.to_owned()),
            kafka_bootstrap_servers: env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|_| Self::DEFAULT_KAFKA_BOOTSTRAP.to_owned()),
            processor_consumer_name: env::var("PROCESSOR_CONSUMER_NAME").unwrap_or_else(|_| "orchid-worker".to_owned()),
            processor_concurrency: env::var("PROCESSOR_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_PROCESSOR_CONCURRENCY),
            processor_batch_size: env::var("PROCESSOR_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_PROCESSOR_BATCH_SIZE),
            processor_block: Duration::from_millis(env_u64("PROCESSOR_BLOCK_MS", Self::DEFAULT_PROCESSOR_BLOCK_MS)),
            processor_claim_idle: Duration::from_secs(env_u64(
                "PROCESSOR_CLAIM_IDLE_SECS",
                Self::DEFAULT_PROCESSOR_CLAIM_IDLE_SECS,
            )),
            processor_claim_interval: Duration::from_secs(env_u64(
                "PROCESSOR_CLAIM_INTERVAL_SECS",
                Self::DEFAULT_PROCESSOR_CLAIM_INTERVAL_SECS,
            )),
            max_job_attempts: env_u32("MAX_JOB_ATTEMPTS", Self::DEFAULT_MAX_JOB_ATTEMPTS),
            redis_streams_dlq: env::var("REDIS_STREAMS_DLQ").unwrap_or_else(|_| Self::DEFAULT_DLQ_STREAM.to_owned()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        // SAFETY: test-only; env var manipulation is safe in single-threaded tests.
        unsafe {
            env::remove_var("MAX_EXECUTION_TIME");
            env::remove_var("MAX_LOOPS");
            env::remove_var("SCHEDULER_ENABLED");
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_execution_time, Duration::from_secs(300));
        assert_eq!(cfg.max_loops, 1000);
        assert_eq!(cfg.max_nesting_depth, 5);
        assert!(cfg.scheduler_enabled);
        assert_eq!(cfg.redis_streams_job_queue, "orchid:jobs");
        assert_eq!(cfg.kafka_response_topic, "api-responses");
        assert_eq!(cfg.processor_concurrency, 20);
        assert_eq!(cfg.max_job_attempts, 5);
        assert_eq!(cfg.redis_streams_dlq, "orchid:dlq");
    }

    #[test]
    fn scheduler_enabled_false_variants() {
        // SAFETY: test-only.
        unsafe { env::set_var("SCHEDULER_ENABLED", "false") };
        assert!(!EngineConfig::from_env().scheduler_enabled);
        // SAFETY: test-only.
        unsafe { env::set_var("SCHEDULER_ENABLED", "0") };
        assert!(!EngineConfig::from_env().scheduler_enabled);
        // SAFETY: test-only.
        unsafe { env::remove_var("SCHEDULER_ENABLED") };
    }

    #[test]
    fn overrides_from_env() {
        // SAFETY: test-only.
        unsafe {
            env::set_var("MAX_LOOPS", "42");
            env::set_var("KAFKA_RESPONSE_TOPIC", "custom-topic");
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_loops, 42);
        assert_eq!(cfg.kafka_response_topic, "custom-topic");
        // SAFETY: test-only.
        unsafe {
            env::remove_var("MAX_LOOPS");
            env::remove_var("KAFKA_RESPONSE_TOPIC");
        }
    }
}
