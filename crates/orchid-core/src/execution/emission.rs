//! Kafka emission: one success/error envelope published per step attempt
//! that reaches a terminal outcome.
//!
//! The `FutureProducer` is built once per process with
//! `rdkafka::ClientConfig::new().set("bootstrap.servers", ...).create()`,
//! the exact construction grounded on
//! `integration-gateway::main`'s Kafka setup. `FutureProducer` clones
//! cheaply (internal `Arc`), so `Emitter` is `Clone` and shared across
//! every Step Executor invocation without its own `Arc` wrapper.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EmissionError {
    #[error("failed to build kafka producer: {0}")]
    Build(#[from] rdkafka::error::KafkaError),
    #[error("failed to serialize emission payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("kafka send failed: {0}")]
    Send(String),
}

/// The envelope published to either the success or error topic, per
/// a stable, documented JSON shape.
#[derive(Debug, Clone, Serialize)]
pub struct StepEmission {
    pub tenant_id: Uuid,
    pub integration: String,
    pub plan_key: String,
    pub config_id: Uuid,
    pub execution_id: Uuid,
    pub step_path: String,
    pub timestamp: DateTime<Utc>,
    pub request_method: String,
    pub request_url: String,
    pub status_code: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Value,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub attempt: u32,
    /// Present only on the error topic: the terminal error's classification
    /// and message.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Build the process-wide `FutureProducer`, configured from
/// `KAFKA_BOOTSTRAP_SERVERS` configuration surface.
pub fn build_producer(bootstrap_servers: &str) -> Result<FutureProducer, EmissionError> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("message.timeout.ms", "5000")
        .create()?;
    Ok(producer)
}

#[derive(Clone)]
pub struct Emitter {
    producer: FutureProducer,
    success_topic: String,
    error_topic: String,
}

impl Emitter {
    pub fn new(producer: FutureProducer, success_topic: impl Into<String>, error_topic: impl Into<String>) -> Self {
        Self {
            producer,
            success_topic: success_topic.into(),
            error_topic: error_topic.into(),
        }
    }

    pub async fn emit_success(&self, payload: &StepEmission) -> Result<(), EmissionError> {
        self.emit(&self.success_topic, payload).await
    }

    pub async fn emit_error(&self, payload: &StepEmission) -> Result<(), EmissionError> {
        self.emit(&self.error_topic, payload).await
    }

    async fn emit(&self, topic: &str, payload: &StepEmission) -> Result<(), EmissionError> {
        let key = payload.execution_id.to_string();
        let body = serde_json::to_vec(payload)?;
        let record = FutureRecord::to(topic).key(&key).payload(&body);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| EmissionError::Send(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_emission_serializes_with_expected_field_names() {
        let emission = StepEmission {
            tenant_id: Uuid::nil(),
            integration: "shopify".into(),
            plan_key: "sync_orders".into(),
            config_id: Uuid::nil(),
            execution_id: Uuid::nil(),
            step_path: "root".into(),
            timestamp: Utc::now(),
            request_method: "GET".into(),
            request_url: "https://api.example/orders".into(),
            status_code: Some(200),
            response_headers: HashMap::new(),
            response_body: serde_json::json!({"ids": [1, 2]}),
            duration_ms: 42,
            size_bytes: 128,
            attempt: 0,
            error_kind: None,
            error_message: None,
        };

        let value = serde_json::to_value(&emission).unwrap();
        assert_eq!(value["plan_key"], "sync_orders");
        assert_eq!(value["status_code"], 200);
        assert!(value["error_kind"].is_null());
    }
}
