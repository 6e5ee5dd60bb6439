//! Scheduling for femrelay.
//!
//! Node capability matching, a generic interval loop, and the job dispatcher
//! built on top of both.

pub mod capability;
pub mod interval;
pub mod jobs;

pub use capability::{
    Compatibility, JobRequirement, NodeCapability, assess, check_compatibility,
    configuration_issues, estimated_queue_time, license_tokens, select_optimal,
};
pub use interval::{
    IntervalScheduler, SchedulerError, SchedulerStats, TickError, TickFuture,
    WeakIntervalScheduler,
};
pub use jobs::{
    JobExecutionScheduler, NodeSelection, RETRIES_EXHAUSTED, RunningJob, SchedulerConfig,
    TickSummary,
};
