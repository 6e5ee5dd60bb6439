//! Shared model for femrelay.
//!
//! Jobs, nodes and input files, the job status transition table, and the
//! events emitted when a job changes status.

pub mod events;
pub mod status;
pub mod types;

pub use events::{JOBS_CHANNEL, JobEvent, StatusChange};
pub use status::{
    JobStatus, TransitionError, can_cancel, can_start, is_active, is_terminal,
    is_transition_allowed, next_possible_states, validate_transition,
};
pub use types::{
    FileId, FileRecord, Job, JobId, Node, NodeConnection, NodeId, NodeStatus, UserId,
};
