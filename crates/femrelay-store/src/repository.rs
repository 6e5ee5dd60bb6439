//! Persistence seams consumed by the orchestration core.
//!
//! All calls are synchronous; the core treats the store as always available and
//! only logs failures.

use chrono::{DateTime, Utc};
use femrelay_state::{FileId, FileRecord, Job, JobId, JobStatus, Node, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Store lock poisoned")]
    Poisoned,
}

pub trait JobRepository: Send + Sync {
    fn find_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    fn find_job_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Set the status; a message, when given, becomes the job's error message.
    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError>;

    fn update_start_time(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn update_end_time(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record the node a job was dispatched to.
    fn assign_node(&self, id: JobId, node_id: NodeId) -> Result<(), StoreError>;
}

pub trait NodeRepository: Send + Sync {
    fn find_all_nodes(&self) -> Result<Vec<Node>, StoreError>;

    fn find_node_by_id(&self, id: NodeId) -> Result<Option<Node>, StoreError>;
}

pub trait FileRepository: Send + Sync {
    fn find_file_by_id(&self, id: FileId) -> Result<Option<FileRecord>, StoreError>;
}
