//! Job execution pipeline for femrelay.
//!
//! Uploads a job's input directory to its node, runs the analysis there with
//! live progress, and fetches results back, keeping the job's persisted status
//! and the event bus in step.

pub mod executor;
pub mod hooks;
pub mod progress;
pub mod result;

pub use executor::{
    ANALYSIS_SCRIPT, ExecutionContext, ExecutorConfig, ExecutorError, JobExecutor,
    remote_working_dir,
};
pub use hooks::ExecutionHooks;
pub use progress::{LineSplitter, Progress, parse_progress};
pub use result::{ExecutionResult, Phase, PhaseResult, PhaseResults};
