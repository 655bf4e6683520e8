//! The declarative plan tree: `PlanDefinition` / `Step` / `RetryConfig`,
//! deserialized from the `plans.definition` and `auth_flows.plan_definition`
//! jsonb columns. A single tagged record with optional fields (not an enum
//! of step kinds): every step may behave as simple request,
//! `while` loop, or fanout, and the Step Executor branches on these fields
//! in one place rather than the type system spreading behavior across
//! variants.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ratelimit::RateLimitConfig;

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_concurrency() -> u32 {
    50
}

fn default_max_execution_seconds() -> u64 {
    300
}

fn default_max_nesting_depth() -> u32 {
    5
}

fn default_method() -> String {
    "GET".to_owned()
}

/// The root of a plan: its main step plus plan-wide bounds and rate-limit
/// policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub root_step: Step,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default = "default_max_execution_seconds")]
    pub max_execution_seconds: u64,
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: u32,
}

/// Backoff schedule shape for step retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fibonacci,
    Exponential,
    Linear,
}

/// Retry policy attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub backoff: BackoffKind,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffKind::Exponential,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// The delay before attempt `n` (1-indexed retry attempt, i.e. the
    /// sleep before the *second* HTTP call is `delay_for(1)`), bounded by
    /// `max_delay_ms`. Fibonacci backoff produces `d, d, 2d, 3d, 5d, ...`
    /// capped by `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let d = self.initial_delay_ms;
        let raw = match self.backoff {
            BackoffKind::Linear => d.saturating_mul(attempt.max(1) as u64),
            BackoffKind::Exponential => d.saturating_mul(1u64 << attempt.min(40)),
            BackoffKind::Fibonacci => fibonacci_delay(d, attempt),
        };
        std::time::Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

/// `d, d, 2d, 3d, 5d, 8d, ...` -- the classic Fibonacci sequence scaled by
/// the initial delay, 1-indexed so `attempt=1` gives the first `d`.
fn fibonacci_delay(d: u64, attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..attempt {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    d.saturating_mul(a)
}

/// How fanout children emit to the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutEmitMode {
    Record,
    Page,
}

impl Default for FanoutEmitMode {
    fn default() -> Self {
        Self::Record
    }
}

/// A single node in the plan tree: request fields, timing/retry, policy
/// predicates, context mutation, and fanout -- all orthogonal toggles on
/// one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Option<String>,

    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub abort_on: Vec<u16>,
    #[serde(default)]
    pub ignore_on: Vec<u16>,
    #[serde(default, rename = "while")]
    pub while_: Option<String>,
    #[serde(default)]
    pub abort_when: Option<String>,
    #[serde(default)]
    pub retry_when: Option<String>,
    #[serde(default)]
    pub ignore_when: Option<String>,
    #[serde(default)]
    pub break_when: Option<String>,

    #[serde(default)]
    pub set_context: HashMap<String, String>,

    #[serde(default)]
    pub iterate_over: Option<String>,
    #[serde(default)]
    pub sub_steps: Vec<Step>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_true")]
    pub emit_to_kafka: bool,
    #[serde(default)]
    pub fanout_emit_mode: FanoutEmitMode,

    #[serde(default)]
    pub auth_flow_id: Option<Uuid>,
}

impl Step {
    pub fn is_fanout(&self) -> bool {
        self.iterate_over.is_some() && !self.sub_steps.is_empty()
    }

    pub fn has_while_loop(&self) -> bool {
        self.while_.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_step_with_defaults() {
        let json = r#"{"url": "https://example.com"}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.method, "GET");
        assert_eq!(step.timeout_seconds, 30);
        assert_eq!(step.concurrency, 50);
        assert!(step.emit_to_kafka);
        assert_eq!(step.fanout_emit_mode, FanoutEmitMode::Record);
        assert!(step.sub_steps.is_empty());
    }

    #[test]
    fn deserializes_while_field_via_rename() {
        let json = r#"{"url": "https://example.com", "while": "response.body.has_more"}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.while_.as_deref(), Some("response.body.has_more"));
        assert!(step.has_while_loop());
    }

    #[test]
    fn plan_definition_defaults() {
        let json = r#"{"root_step": {"url": "https://example.com"}}"#;
        let plan: PlanDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(plan.max_execution_seconds, 300);
        assert_eq!(plan.max_nesting_depth, 5);
        assert!(plan.rate_limits.is_empty());
    }

    #[test]
    fn exponential_backoff_sequence() {
        let cfg = RetryConfig {
            max_retries: 5,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
        };
        assert_eq!(cfg.delay_for(1).as_millis(), 200);
        assert_eq!(cfg.delay_for(2).as_millis(), 400);
        assert_eq!(cfg.delay_for(3).as_millis(), 800);
    }

    #[test]
    fn fibonacci_backoff_sequence_matches_spec() {
        let cfg = RetryConfig {
            max_retries: 6,
            backoff: BackoffKind::Fibonacci,
            initial_delay_ms: 1,
            max_delay_ms: 1_000_000,
        };
        // fibonacci-shaped: d, d, 2d, 3d, 5d, ...
        let seq: Vec<u128> = (1..=5).map(|a| cfg.delay_for(a).as_millis()).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5]);
    }

    #[test]
    fn backoff_bounded_by_max_delay() {
        let cfg = RetryConfig {
            max_retries: 10,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(cfg.delay_for(10).as_millis(), 5000);
    }

    #[test]
    fn is_fanout_requires_both_iterate_over_and_sub_steps() {
        let mut step: Step = serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        assert!(!step.is_fanout());
        step.iterate_over = Some("response.ids".to_owned());
        assert!(!step.is_fanout());
        step.sub_steps.push(step.clone());
        assert!(step.is_fanout());
    }
}
