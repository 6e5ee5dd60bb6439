//! Periodic dispatch of waiting jobs onto nodes.

use crate::capability::{JobRequirement, check_compatibility, select_optimal};
use crate::interval::{IntervalScheduler, SchedulerError, SchedulerStats, TickError};
use chrono::Utc;
use femrelay_exec::JobExecutor;
use femrelay_state::{
    FileRecord, JOBS_CHANNEL, Job, JobEvent, JobId, JobStatus, Node, NodeId, validate_transition,
};
use femrelay_store::{EventPublisher, FileRepository, JobRepository, NodeRepository, StoreError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

/// Message recorded on jobs that used up their retries.
pub const RETRIES_EXHAUSTED: &str = "max retries exceeded";

/// How a node is picked when a job has no usable assigned node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeSelection {
    /// First compatible node in id order
    #[default]
    FirstFit,
    /// Least utilized compatible node
    Optimal,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between ticks while nothing is running
    pub check_interval: Duration,
    /// Delay between ticks while executions are in flight
    pub busy_check_interval: Duration,
    pub max_concurrent_jobs: usize,
    /// Minimum wait before a failed job is tried again
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub node_selection: NodeSelection,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            busy_check_interval: Duration::from_secs(10),
            max_concurrent_jobs: 3,
            retry_interval: Duration::from_secs(60),
            max_retries: 3,
            node_selection: NodeSelection::FirstFit,
        }
    }
}

impl SchedulerConfig {
    /// Tick delay given whether any execution is in flight.
    pub fn next_interval(&self, busy: bool) -> Duration {
        if busy {
            self.busy_check_interval.min(self.check_interval)
        } else {
            self.check_interval
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunningJob {
    pub job_id: JobId,
    pub node_id: NodeId,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub dispatched: Vec<JobId>,
    /// Jobs moved to failed after running out of retries
    pub exhausted: Vec<JobId>,
    /// Jobs left waiting because no node could take them
    pub unplaced: Vec<JobId>,
}

struct Shared {
    jobs: Arc<dyn JobRepository>,
    nodes: Arc<dyn NodeRepository>,
    files: Arc<dyn FileRepository>,
    events: Arc<dyn EventPublisher>,
    executor: Arc<JobExecutor>,
    config: SchedulerConfig,
    running: Mutex<HashMap<JobId, RunningJob>>,
    failures: Mutex<HashMap<JobId, FailureRecord>>,
    tracker: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a job from the running set when its task ends, however it ends.
struct RunningGuard {
    shared: Arc<Shared>,
    job_id: JobId,
    finished: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.shared.running).remove(&self.job_id);
        if !self.finished {
            tracing::error!(job_id = self.job_id, "Job execution task ended without a result");
            self.shared.record_failure(self.job_id);
        }
    }
}

/// Polls for waiting jobs and runs them on compatible nodes.
pub struct JobExecutionScheduler {
    shared: Arc<Shared>,
    interval: IntervalScheduler,
}

impl JobExecutionScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        nodes: Arc<dyn NodeRepository>,
        files: Arc<dyn FileRepository>,
        events: Arc<dyn EventPublisher>,
        executor: Arc<JobExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let interval = IntervalScheduler::new("job-execution", config.check_interval)?;
        if config.busy_check_interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let shared = Arc::new(Shared {
            jobs,
            nodes,
            files,
            events,
            executor,
            config,
            running: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        });

        let tick_shared = Arc::clone(&shared);
        let handle = interval.downgrade();
        interval.on_tick(move || {
            let shared = Arc::clone(&tick_shared);
            let handle = handle.clone();
            async move {
                let outcome = shared.tick().map(|_| ());
                let busy = !lock(&shared.running).is_empty();
                if let Some(scheduler) = handle.upgrade() {
                    scheduler.set_interval(shared.config.next_interval(busy))?;
                }
                outcome.map_err(|e| Box::new(e) as TickError)
            }
        });

        Ok(Self { shared, interval })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        self.interval.start()
    }

    pub fn stop(&self) {
        self.interval.stop();
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_running()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.interval.stats()
    }

    /// The underlying interval loop, for signal handling and stats logging.
    pub fn interval(&self) -> &IntervalScheduler {
        &self.interval
    }

    /// Run one dispatch pass immediately.
    pub fn tick(&self) -> Result<TickSummary, StoreError> {
        self.shared.tick()
    }

    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let mut running: Vec<RunningJob> = lock(&self.shared.running).values().copied().collect();
        running.sort_by_key(|r| r.job_id);
        running
    }

    /// Failure count of a job still eligible for retry.
    pub fn failure_count(&self, job_id: JobId) -> u32 {
        lock(&self.shared.failures)
            .get(&job_id)
            .map(|r| r.count)
            .unwrap_or(0)
    }

    /// Wait until every dispatched execution has finished.
    pub async fn wait_idle(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.tracker.reopen();
    }

    /// Stop ticking and wait for in-flight executions to finish.
    pub async fn shutdown(&self) {
        self.interval.stop();
        self.interval.join().await;

        let in_flight = self.shared.tracker.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for running jobs to finish");
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        tracing::info!("Job scheduler shut down");
    }
}

impl Shared {
    fn tick(self: &Arc<Self>) -> Result<TickSummary, StoreError> {
        let mut summary = TickSummary::default();
        let waiting = self.jobs.find_jobs_by_status(JobStatus::Waiting)?;
        let candidates = self.eligible(waiting, &mut summary);

        let running_count = lock(&self.running).len();
        let capacity = self.config.max_concurrent_jobs.saturating_sub(running_count);
        if candidates.is_empty() || capacity == 0 {
            if !candidates.is_empty() {
                tracing::debug!(
                    waiting = candidates.len(),
                    running = running_count,
                    "Concurrency limit reached"
                );
            }
            return Ok(summary);
        }

        let nodes = self.active_nodes()?;
        let mut placed = self.placed_jobs()?;

        for job in candidates.into_iter().take(capacity) {
            let Some(node) = self.choose_node(&job, &nodes, &placed) else {
                tracing::debug!(job_id = job.id, cpu_cores = job.cpu_cores, "No compatible node");
                summary.unplaced.push(job.id);
                continue;
            };

            let file = match self.files.find_file_by_id(job.file_id) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    tracing::warn!(job_id = job.id, file_id = job.file_id, "Input file not found");
                    self.record_failure(job.id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = job.id, "Failed to load input file record: {}", e);
                    self.record_failure(job.id);
                    continue;
                }
            };

            let mut claimed = job.clone();
            claimed.status = JobStatus::Starting;
            claimed.node_id = Some(node.id);
            placed.entry(node.id).or_default().push(claimed);

            summary.dispatched.push(job.id);
            self.dispatch(job, node, file);
        }

        if !summary.dispatched.is_empty() {
            tracing::info!(jobs = ?summary.dispatched, "Dispatched jobs");
        }
        Ok(summary)
    }

    /// Waiting jobs that are neither running nor cooling down, in dispatch
    /// order. Jobs out of retries are failed on the way.
    fn eligible(&self, waiting: Vec<Job>, summary: &mut TickSummary) -> Vec<Job> {
        let running: HashSet<JobId> = lock(&self.running).keys().copied().collect();
        let now = Instant::now();
        let retry = self.config.retry_interval;
        let mut candidates = Vec::new();

        // Jobs that left the queue for good keep no failure record
        let queued: HashSet<JobId> = waiting.iter().map(|j| j.id).collect();
        lock(&self.failures).retain(|id, _| queued.contains(id) || running.contains(id));

        for job in waiting {
            if running.contains(&job.id) {
                continue;
            }
            let record = lock(&self.failures).get(&job.id).copied();
            match record {
                Some(r) if r.count >= self.config.max_retries => {
                    self.exhaust(&job);
                    summary.exhausted.push(job.id);
                }
                Some(r) if !retry_window_elapsed(r.last_failure, retry, now) => {
                    tracing::trace!(job_id = job.id, failures = r.count, "Job in retry backoff");
                }
                _ => candidates.push(job),
            }
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        candidates
    }

    fn exhaust(&self, job: &Job) {
        lock(&self.failures).remove(&job.id);
        if let Err(e) = validate_transition(job.status, JobStatus::Failed) {
            tracing::warn!(job_id = job.id, "Cannot fail job: {}", e);
            return;
        }

        tracing::warn!(job_id = job.id, max_retries = self.config.max_retries, "Giving up on job");
        if let Err(e) = self
            .jobs
            .update_job_status(job.id, JobStatus::Failed, Some(RETRIES_EXHAUSTED))
            .and_then(|_| self.jobs.update_end_time(job.id, Utc::now()))
        {
            tracing::error!(job_id = job.id, "Failed to persist job failure: {}", e);
        }
        self.events.publish(
            JOBS_CHANNEL,
            JobEvent::status_changed(
                job.id,
                JobStatus::Failed,
                Some(RETRIES_EXHAUSTED.to_string()),
            ),
        );
    }

    fn active_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let mut nodes: Vec<Node> = self
            .nodes
            .find_all_nodes()?
            .into_iter()
            .filter(|n| n.is_active)
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    /// Active jobs per node according to the repository.
    fn placed_jobs(&self) -> Result<HashMap<NodeId, Vec<Job>>, StoreError> {
        let mut placed: HashMap<NodeId, Vec<Job>> = HashMap::new();
        for status in [JobStatus::Starting, JobStatus::Running] {
            for job in self.jobs.find_jobs_by_status(status)? {
                if let Some(node_id) = job.node_id {
                    placed.entry(node_id).or_default().push(job);
                }
            }
        }
        Ok(placed)
    }

    fn choose_node(
        &self,
        job: &Job,
        nodes: &[Node],
        placed: &HashMap<NodeId, Vec<Job>>,
    ) -> Option<Node> {
        let requirement = JobRequirement::from(job);
        let fits = |node: &Node| {
            let current = placed.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
            check_compatibility(&requirement, node, current).compatible
        };

        if let Some(assigned) = job.node_id.and_then(|id| nodes.iter().find(|n| n.id == id)) {
            if assigned.is_available() && fits(assigned) {
                return Some(assigned.clone());
            }
            tracing::debug!(
                job_id = job.id,
                node_id = assigned.id,
                "Assigned node cannot take job"
            );
        }

        match self.config.node_selection {
            NodeSelection::FirstFit => nodes.iter().find(|n| fits(*n)).cloned(),
            NodeSelection::Optimal => select_optimal(job, nodes, placed).cloned(),
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job, node: Node, file: FileRecord) {
        let job_id = job.id;
        lock(&self.running).insert(
            job_id,
            RunningJob {
                job_id,
                node_id: node.id,
            },
        );
        let guard = RunningGuard {
            shared: Arc::clone(self),
            job_id,
            finished: false,
        };

        tracing::info!(job_id, node = %node.name, "Starting job");
        let shared = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut guard = guard;
            let result = shared.executor.execute_job(&job, &node, &file, None).await;
            if result.success {
                shared.clear_failure(job_id);
            } else {
                shared.record_failure(job_id);
            }
            guard.finished = true;
        });
    }

    fn record_failure(&self, job_id: JobId) {
        let mut failures = lock(&self.failures);
        let record = failures.entry(job_id).or_insert(FailureRecord {
            count: 0,
            last_failure: Instant::now(),
        });
        record.count += 1;
        record.last_failure = Instant::now();
        tracing::debug!(job_id, failures = record.count, "Recorded job failure");
    }

    fn clear_failure(&self, job_id: JobId) {
        lock(&self.failures).remove(&job_id);
    }
}

/// An unrepresentable window end never elapses.
fn retry_window_elapsed(last_failure: Instant, retry_interval: Duration, now: Instant) -> bool {
    last_failure
        .checked_add(retry_interval)
        .is_some_and(|end| now >= end)
}
