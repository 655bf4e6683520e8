//! HTTP Requestor: issues one outbound call for a resolved (post-templating)
//! step and captures a `ResponseEnvelope`.
//!
//! Wraps a single process-wide `reqwest::Client` -- built once and shared,
//! same lifecycle as the expression cache and the Redis `ConnectionManager`.
//! The call is
//! wrapped in `tokio::time::timeout` rather than relying on `reqwest`'s own
//! per-request timeout alone, so a caller-supplied deadline (the minimum of
//! the step's `timeout_seconds` and the plan's remaining execution budget)
//! can cut a request short even mid-body-read, matching the corpus's general
//! preference for an outer `tokio::time::timeout` around a spawned unit of
//! work rather than leaving a hung request to block a worker slot indefinitely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cancelled")]
    Cancelled,
}

/// A fully resolved (templated) request, ready to issue.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Option<Value>,
}

/// Captured response: status, headers, parsed body, and timing/size.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub status_code: u16,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, or `Value::Null` when the body is empty or not
    /// valid JSON.
    pub body: Value,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub final_url: String,
}

impl ResponseEnvelope {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status_code": self.status_code,
            "headers": self.headers,
            "body": self.body,
            "duration_ms": self.duration_ms,
            "size_bytes": self.size_bytes,
            "final_url": self.final_url,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A thin wrapper over one shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpRequestor {
    client: Client,
}

impl HttpRequestor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Issue `request`, bounded by `timeout`. Never retries; the Step
    /// Executor owns retry policy.
    pub async fn execute_request(
        &self,
        request: &ResolvedRequest,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.query_params {
            builder = builder.query(&[(name, value)]);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .map_err(|_| HttpError::Timeout(timeout))??;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();

        let bytes = tokio::time::timeout(timeout.saturating_sub(started.elapsed()), response.bytes())
            .await
            .map_err(|_| HttpError::Timeout(timeout))??;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        Ok(ResponseEnvelope {
            status_code,
            headers,
            body,
            duration_ms: started.elapsed().as_millis() as u64,
            size_bytes: bytes.len() as u64,
            final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn requestor() -> HttpRequestor {
        HttpRequestor::new(Client::builder().build().unwrap())
    }

    #[tokio::test]
    async fn captures_status_headers_and_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Custom", "yes")
                    .set_body_json(serde_json::json!([{"id": 1}])),
            )
            .mount(&server)
            .await;

        let request = ResolvedRequest {
            method: "GET".to_owned(),
            url: format!("{}/users", server.uri()),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
        };

        let envelope = requestor()
            .execute_request(&request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(envelope.status_code, 200);
        assert!(envelope.is_success());
        assert_eq!(envelope.headers.get("x-custom"), Some(&"yes".to_owned()));
        assert_eq!(envelope.body, serde_json::json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn empty_body_parses_to_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/items/1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let request = ResolvedRequest {
            method: "DELETE".to_owned(),
            url: format!("{}/items/1", server.uri()),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
        };

        let envelope = requestor()
            .execute_request(&request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(envelope.status_code, 204);
        assert_eq!(envelope.body, Value::Null);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let request = ResolvedRequest {
            method: "GET".to_owned(),
            url: format!("{}/slow", server.uri()),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
        };

        let result = requestor()
            .execute_request(&request, Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(HttpError::Timeout(_))));
    }
}
