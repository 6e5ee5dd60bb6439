//! Structured outcome of one job execution.

use camino::Utf8PathBuf;
use femrelay_remote::{TransferError, TransferResult};
use femrelay_state::JobId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    FileTransferSend,
    AbaqusExecution,
    FileTransferReceive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::FileTransferSend => "upload",
            Phase::AbaqusExecution => "execution",
            Phase::FileTransferReceive => "download",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub success: bool,
    pub elapsed_ms: u64,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl PhaseResult {
    pub fn succeeded(elapsed: Duration, exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            elapsed_ms: elapsed.as_millis() as u64,
            exit_code,
            error_message: None,
        }
    }

    pub fn failed(elapsed: Duration, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            elapsed_ms: elapsed.as_millis() as u64,
            exit_code,
            error_message: Some(message.into()),
        }
    }

    pub(crate) fn from_transfer(
        outcome: &Result<TransferResult, TransferError>,
        elapsed: Duration,
    ) -> Self {
        match outcome {
            Ok(result) => Self::succeeded(result.elapsed, result.exit_code),
            Err(e) => {
                let exit_code = match e {
                    TransferError::Remote { exit_code, .. } => *exit_code,
                    _ => None,
                };
                Self::failed(elapsed, exit_code, e.to_string())
            }
        }
    }
}

/// Per-phase results; a phase that never ran stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResults {
    pub file_transfer_send: Option<PhaseResult>,
    pub abaqus_execution: Option<PhaseResult>,
    pub file_transfer_receive: Option<PhaseResult>,
}

impl PhaseResults {
    pub fn get(&self, phase: Phase) -> Option<&PhaseResult> {
        match phase {
            Phase::FileTransferSend => self.file_transfer_send.as_ref(),
            Phase::AbaqusExecution => self.abaqus_execution.as_ref(),
            Phase::FileTransferReceive => self.file_transfer_receive.as_ref(),
        }
    }

    pub(crate) fn set(&mut self, phase: Phase, result: PhaseResult) {
        let slot = match phase {
            Phase::FileTransferSend => &mut self.file_transfer_send,
            Phase::AbaqusExecution => &mut self.abaqus_execution,
            Phase::FileTransferReceive => &mut self.file_transfer_receive,
        };
        *slot = Some(result);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub success: bool,
    pub phases: PhaseResults,
    /// Wall clock from entry to return, whatever the outcome
    pub total_execution_time_ms: u64,
    pub error_message: Option<String>,
    /// Files fetched back into the local result directory
    pub output_files: Vec<Utf8PathBuf>,
}

impl ExecutionResult {
    pub(crate) fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            success: false,
            phases: PhaseResults::default(),
            total_execution_time_ms: 0,
            error_message: None,
            output_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_phase_names() {
        let mut result = ExecutionResult::new(3);
        result.phases.set(
            Phase::FileTransferSend,
            PhaseResult::failed(Duration::from_millis(12), Some(1), "denied"),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["phases"]["fileTransferSend"]["errorMessage"], "denied");
        assert!(value["phases"]["abaqusExecution"].is_null());
        assert_eq!(value["totalExecutionTimeMs"], 0);
        assert_eq!(value["success"], false);
    }
}
