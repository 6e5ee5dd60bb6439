use crate::progress::Progress;
use crate::result::{Phase, PhaseResult};
use femrelay_state::{JobId, JobStatus};

/// Observer for one job execution. Every method defaults to a no-op.
///
/// Called from the task running the pipeline, never concurrently.
pub trait ExecutionHooks: Send + Sync {
    fn on_status_change(&self, _job_id: JobId, _status: JobStatus, _message: Option<&str>) {}
    fn on_phase_start(&self, _phase: Phase) {}
    fn on_phase_complete(&self, _phase: Phase, _result: &PhaseResult) {}
    fn on_progress(&self, _progress: &Progress) {}
    /// One complete line of analysis output.
    fn on_stdout(&self, _line: &str) {}
    fn on_stderr(&self, _text: &str) {}
    /// `phase` is None for failures before any phase started.
    fn on_error(&self, _phase: Option<Phase>, _message: &str) {}
}

/// Hooks that ignore everything.
pub(crate) struct NoHooks;

impl ExecutionHooks for NoHooks {}
