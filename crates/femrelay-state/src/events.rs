//! Events pushed to observers when a job changes.

use crate::status::JobStatus;
use crate::types::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel job events are published on.
pub const JOBS_CHANNEL: &str = "jobs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    JobStatusChanged(StatusChange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn status_changed(job_id: JobId, status: JobStatus, message: Option<String>) -> Self {
        JobEvent::JobStatusChanged(StatusChange {
            job_id,
            status,
            message,
            timestamp: Utc::now(),
        })
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobStatusChanged(change) => change.job_id,
        }
    }
}
