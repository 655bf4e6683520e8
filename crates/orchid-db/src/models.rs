use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a [`PlanExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Classification of an execution-terminating error, as recorded on
/// [`PlanExecution::error_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Transient,
    Permanent,
    RateLimit,
    Timeout,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorType {
    type Err = ErrorTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "rate_limit" => Ok(Self::RateLimit),
            "timeout" => Ok(Self::Timeout),
            other => Err(ErrorTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorType`] string.
#[derive(Debug, Clone)]
pub struct ErrorTypeParseError(pub String);

impl fmt::Display for ErrorTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error type: {:?}", self.0)
    }
}

impl std::error::Error for ErrorTypeParseError {}

// ---------------------------------------------------------------------------

/// Reason a job was written to the dead-letter table, mirroring the `reason`
/// field of the DLQ stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxRetriesExceeded,
    InvalidJob,
    PlanNotFound,
    ConfigError,
    AuthError,
    Timeout,
    Panic,
    Unknown,
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::InvalidJob => "invalid_job",
            Self::PlanNotFound => "plan_not_found",
            Self::ConfigError => "config_error",
            Self::AuthError => "auth_error",
            Self::Timeout => "timeout",
            Self::Panic => "panic",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for DlqReason {
    type Err = DlqReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_retries_exceeded" => Ok(Self::MaxRetriesExceeded),
            "invalid_job" => Ok(Self::InvalidJob),
            "plan_not_found" => Ok(Self::PlanNotFound),
            "config_error" => Ok(Self::ConfigError),
            "auth_error" => Ok(Self::AuthError),
            "timeout" => Ok(Self::Timeout),
            "panic" => Ok(Self::Panic),
            "unknown" => Ok(Self::Unknown),
            other => Err(DlqReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DlqReason`] string.
#[derive(Debug, Clone)]
pub struct DlqReasonParseError(pub String);

impl fmt::Display for DlqReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dlq reason: {:?}", self.0)
    }
}

impl std::error::Error for DlqReasonParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An upstream system plans poll against, scoping plans/configs/auth flows
/// to a tenant-visible grouping.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Integration {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A plan -- the reusable, versioned definition of a polling workflow.
///
/// `definition` holds the serialized step tree (root step, rate limits,
/// `max_execution_seconds`, `max_nesting_depth`). Callers deserialize it
/// into `orchid_core::plan::PlanDefinition`; this crate stores it opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_key: String,
    pub integration_id: Uuid,
    pub enabled: bool,
    pub wait_seconds: i32,
    pub repeat_count: Option<i32>,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named set of values a plan is executed against (e.g. one per customer
/// account). `values` is merged into `ExecutionContext::config` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Config {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub values: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A reusable token-acquisition subplan, invoked by the Auth Manager.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthFlow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub plan_definition: serde_json::Value,
    pub token_path: String,
    pub header_name: String,
    pub header_format: Option<String>,
    pub refresh_path: Option<String>,
    pub expires_in_path: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub skew_seconds: i32,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row for one plan invocation (or one fanout child
/// invocation, via `parent_execution_id`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_key: String,
    pub config_id: Uuid,
    pub parent_execution_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub step_path: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_type: Option<ErrorType>,
    pub retry_count: i32,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub response_status_code: Option<i32>,
    pub response_size_bytes: Option<i64>,
}

/// One key in the flattened `(tenant, plan, config)` context bag.
///
/// Stored as one row per key rather than a single jsonb blob so
/// `set_context` merge-on-write is a per-key upsert with no
/// read-modify-write race (see the optimistic-locking discussion in
/// `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanContextEntry {
    pub tenant_id: Uuid,
    pub plan_key: String,
    pub config_id: Uuid,
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Rolling execution statistics for a `(plan, config)` pair, used by the
/// Scheduler's due-query and surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanStatistics {
    pub tenant_id: Uuid,
    pub plan_key: String,
    pub config_id: Uuid,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_duration_ms: f64,
}

/// Durable mirror of a DLQ stream entry, written by the Processor so DLQ
/// contents survive Redis stream trimming.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_key: Option<String>,
    pub config_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub original_job: serde_json::Value,
    pub reason: DlqReason,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub trace_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_display_roundtrip() {
        let variants = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Aborted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        let result = "bogus".parse::<ExecutionStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn error_type_display_roundtrip() {
        let variants = [
            ErrorType::Transient,
            ErrorType::Permanent,
            ErrorType::RateLimit,
            ErrorType::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ErrorType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn error_type_invalid() {
        let result = "nope".parse::<ErrorType>();
        assert!(result.is_err());
    }

    #[test]
    fn dlq_reason_display_roundtrip() {
        let variants = [
            DlqReason::MaxRetriesExceeded,
            DlqReason::InvalidJob,
            DlqReason::PlanNotFound,
            DlqReason::ConfigError,
            DlqReason::AuthError,
            DlqReason::Timeout,
            DlqReason::Panic,
            DlqReason::Unknown,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: DlqReason = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn dlq_reason_invalid() {
        let result = "mystery".parse::<DlqReason>();
        assert!(result.is_err());
    }
}
