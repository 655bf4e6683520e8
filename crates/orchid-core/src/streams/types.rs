//! Wire types for the job queue and DLQ stream ("External
//! Interfaces").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orchid_db::models::DlqReason;

/// Payload of a `plan_execution` job, the only job type this engine
/// currently dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionPayload {
    pub tenant_id: Uuid,
    pub integration: String,
    pub plan_key: String,
    pub config_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
}

/// Inbound job envelope read off the job stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: PlanExecutionPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl JobMessage {
    pub const PLAN_EXECUTION: &str = "plan_execution";

    pub fn new_plan_execution(payload: PlanExecutionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: payload.tenant_id,
            job_type: Self::PLAN_EXECUTION.to_owned(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Build the re-publish copy of this job with `attempts` incremented,
    /// so a crashed consumer's claimed work can be recovered.
    pub fn retried(&self) -> Self {
        Self {
            id: self.id,
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }
}

/// DLQ entry shape written to the DLQ stream (field `data`), mirroring
/// `orchid_db::models::DeadLetter` but carrying the full original job so
/// a replay tool never needs to recompute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqJobEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_key: Option<String>,
    pub config_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub original_job: JobMessage,
    pub reason: DlqReason,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub trace_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> PlanExecutionPayload {
        PlanExecutionPayload {
            tenant_id: Uuid::new_v4(),
            integration: "stripe".to_owned(),
            plan_key: "sync_customers".to_owned(),
            config_id: Uuid::new_v4(),
            scheduled_at: Utc::now(),
        }
    }

    #[test]
    fn new_plan_execution_starts_at_zero_attempts() {
        let job = JobMessage::new_plan_execution(sample_payload());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.job_type, "plan_execution");
    }

    #[test]
    fn retried_increments_attempts_keeps_id() {
        let job = JobMessage::new_plan_execution(sample_payload());
        let retried = job.retried();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempts, 1);
        let twice = retried.retried();
        assert_eq!(twice.attempts, 2);
    }

    #[test]
    fn roundtrip_through_json() {
        let job = JobMessage::new_plan_execution(sample_payload());
        let text = serde_json::to_string(&job).unwrap();
        let back: JobMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.payload.plan_key, job.payload.plan_key);
    }
}
