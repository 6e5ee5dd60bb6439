//! Job status and the transition table that governs it.
//!
//! Every legality check in the workspace goes through this module; callers
//! never compare statuses by hand to decide whether a move is allowed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting for the scheduler
    Waiting,
    /// Input files are being uploaded to the node
    Starting,
    /// Analysis is running on the node
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Lost track of the remote run
    Missing,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal job status transition: {from} -> {to}")]
    Illegal { from: JobStatus, to: JobStatus },
    #[error("Unknown job status: {0}")]
    UnknownStatus(String),
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Missing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Missing => "missing",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Missing => "Missing",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Waiting => "○",
            Self::Starting => "◐",
            Self::Running => "●",
            Self::Completed => "✓",
            Self::Failed => "✗",
            Self::Missing => "?",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lowered)
            .ok_or_else(|| TransitionError::UnknownStatus(s.to_string()))
    }
}

/// Outgoing edges of the transition table.
pub fn next_possible_states(status: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match status {
        Waiting => &[Starting, Failed],
        Starting => &[Running, Failed, Missing],
        Running => &[Completed, Failed, Missing],
        Completed | Failed | Missing => &[],
    }
}

pub fn is_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    next_possible_states(from).contains(&to)
}

/// Like [`is_transition_allowed`] but returns an error naming both states.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    if is_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

pub fn is_terminal(status: JobStatus) -> bool {
    next_possible_states(status).is_empty()
}

/// The job occupies node resources.
pub fn is_active(status: JobStatus) -> bool {
    matches!(status, JobStatus::Starting | JobStatus::Running)
}

pub fn can_start(status: JobStatus) -> bool {
    status == JobStatus::Waiting
}

pub fn can_cancel(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Waiting | JobStatus::Starting | JobStatus::Running
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGES: &[(JobStatus, JobStatus)] = &[
        (JobStatus::Waiting, JobStatus::Starting),
        (JobStatus::Waiting, JobStatus::Failed),
        (JobStatus::Starting, JobStatus::Running),
        (JobStatus::Starting, JobStatus::Failed),
        (JobStatus::Starting, JobStatus::Missing),
        (JobStatus::Running, JobStatus::Completed),
        (JobStatus::Running, JobStatus::Failed),
        (JobStatus::Running, JobStatus::Missing),
    ];

    #[test]
    fn test_only_table_edges_are_allowed() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = EDGES.contains(&(from, to));
                assert_eq!(
                    is_transition_allowed(from, to),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Missing] {
            assert!(is_terminal(from));
            assert!(JobStatus::ALL.iter().all(|to| !is_transition_allowed(from, *to)));
        }
        assert!(!is_terminal(JobStatus::Waiting));
    }

    #[test]
    fn test_status_predicates() {
        assert!(is_active(JobStatus::Starting));
        assert!(is_active(JobStatus::Running));
        assert!(!is_active(JobStatus::Waiting));

        assert!(can_start(JobStatus::Waiting));
        assert!(!can_start(JobStatus::Starting));

        assert!(can_cancel(JobStatus::Running));
        assert!(!can_cancel(JobStatus::Completed));
    }

    #[test]
    fn test_validate_transition_names_states() {
        let err = validate_transition(JobStatus::Completed, JobStatus::Running).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Illegal job status transition: completed -> running"
        );
        assert!(validate_transition(JobStatus::Waiting, JobStatus::Starting).is_ok());
    }

    #[test]
    fn test_parse_and_serialize() {
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("paused".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::Missing).unwrap(),
            "\"missing\""
        );
    }
}
