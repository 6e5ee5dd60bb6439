//! Upload → remote analysis → download pipeline for one job.

use crate::hooks::{ExecutionHooks, NoHooks};
use crate::progress::{LineSplitter, parse_progress};
use crate::result::{ExecutionResult, Phase, PhaseResult};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use femrelay_remote::{
    CommandError, CommandEvent, EventKind, FileTransferService, RemoteCommand, RemoteRunner,
    TextEncoding, TransferError,
};
use femrelay_state::{
    FileRecord, JOBS_CHANNEL, Job, JobEvent, JobId, JobStatus, Node, can_start, validate_transition,
};
use femrelay_store::{EventPublisher, JobRepository};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Script that runs the analysis on the node.
pub const ANALYSIS_SCRIPT: &str = "executeAbaqus";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid job id: {0}")]
    InvalidJobId(JobId),
    #[error("Job {job_id} cannot start from status {status}")]
    NotStartable { job_id: JobId, status: JobStatus },
    #[error("Upload failed: {0}")]
    Upload(TransferError),
    #[error("Analysis failed: {0}")]
    Analysis(String),
    #[error("Analysis could not be started: {0}")]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root of per-job working directories on the nodes
    pub remote_root: String,
    /// Local root that results are downloaded into
    pub results_root: Utf8PathBuf,
    pub analysis_script: String,
    /// Encoding of the analysis script's output
    pub encoding: TextEncoding,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_root: "/scratch/femrelay".to_string(),
            results_root: Utf8PathBuf::from("results"),
            analysis_script: ANALYSIS_SCRIPT.to_string(),
            encoding: TextEncoding::default(),
        }
    }
}

/// Everything one `execute_job` call works with.
#[derive(Debug, Clone)]
pub struct ExecutionContext<'a> {
    pub job: &'a Job,
    pub node: &'a Node,
    pub file: &'a FileRecord,
    pub remote_dir: String,
    pub results_dir: Utf8PathBuf,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        config: &ExecutorConfig,
        job: &'a Job,
        node: &'a Node,
        file: &'a FileRecord,
    ) -> Self {
        Self {
            job,
            node,
            file,
            remote_dir: remote_working_dir(&config.remote_root, job, node),
            results_dir: config.results_root.join(format!("job_{}", job.id)),
        }
    }
}

/// `{root}/{node name}/job_{id}`, with the node name reduced to path-safe characters.
pub fn remote_working_dir(remote_root: &str, job: &Job, node: &Node) -> String {
    let node_part: String = node
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let node_part = if node_part.is_empty() {
        format!("node_{}", node.id)
    } else {
        node_part
    };
    format!("{}/{}/job_{}", remote_root.trim_end_matches('/'), node_part, job.id)
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

pub struct JobExecutor {
    jobs: Arc<dyn JobRepository>,
    events: Arc<dyn EventPublisher>,
    transfers: FileTransferService,
    runner: Arc<dyn RemoteRunner>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        events: Arc<dyn EventPublisher>,
        transfers: FileTransferService,
        runner: Arc<dyn RemoteRunner>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            jobs,
            events,
            transfers,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the full lifecycle of one job.
    ///
    /// Never returns an error: failures are folded into the result and the
    /// job's persisted status.
    pub async fn execute_job(
        &self,
        job: &Job,
        node: &Node,
        file: &FileRecord,
        hooks: Option<&dyn ExecutionHooks>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let hooks = hooks.unwrap_or(&NoHooks);
        let mut result = ExecutionResult::new(job.id);

        let rejection = if job.id <= 0 {
            Some(ExecutorError::InvalidJobId(job.id))
        } else if !can_start(job.status) {
            Some(ExecutorError::NotStartable {
                job_id: job.id,
                status: job.status,
            })
        } else {
            None
        };
        if let Some(e) = rejection {
            tracing::warn!(job_id = job.id, "Rejected job: {}", e);
            hooks.on_error(None, &e.to_string());
            result.error_message = Some(e.to_string());
            result.total_execution_time_ms = elapsed_ms(started);
            return result;
        }

        let ctx = ExecutionContext::new(&self.config, job, node, file);
        let mut status = job.status;
        tracing::info!(
            job_id = job.id,
            node = %node.name,
            remote_dir = %ctx.remote_dir,
            "Executing job"
        );

        // Upload
        self.set_status(
            job.id,
            &mut status,
            JobStatus::Starting,
            Some("Uploading input files"),
            hooks,
        );
        if let Err(e) = self.jobs.assign_node(job.id, node.id) {
            tracing::error!(job_id = job.id, "Failed to record node assignment: {}", e);
        }
        hooks.on_phase_start(Phase::FileTransferSend);
        let phase_started = Instant::now();
        let upload = self
            .transfers
            .send_directory(
                ctx.file.directory().as_str(),
                ctx.remote_dir.as_str(),
                node.connection(),
                None,
            )
            .await;
        let phase = PhaseResult::from_transfer(&upload, phase_started.elapsed());
        self.finish_phase(&mut result, Phase::FileTransferSend, phase, hooks);
        if let Err(e) = upload {
            return self.fail(
                result,
                &mut status,
                Phase::FileTransferSend,
                ExecutorError::Upload(e),
                hooks,
                started,
            );
        }

        // Remote execution
        self.set_status(job.id, &mut status, JobStatus::Running, Some("Running analysis"), hooks);
        hooks.on_phase_start(Phase::AbaqusExecution);
        let phase_started = Instant::now();
        let analysis = self.run_analysis(&ctx, hooks).await;
        let phase = match &analysis {
            Ok(exit_code) => PhaseResult::succeeded(phase_started.elapsed(), *exit_code),
            Err((exit_code, e)) => {
                PhaseResult::failed(phase_started.elapsed(), *exit_code, e.to_string())
            }
        };
        self.finish_phase(&mut result, Phase::AbaqusExecution, phase, hooks);
        if let Err((_, e)) = analysis {
            return self.fail(result, &mut status, Phase::AbaqusExecution, e, hooks, started);
        }

        // Download; failure here is tolerated
        hooks.on_phase_start(Phase::FileTransferReceive);
        let phase_started = Instant::now();
        let download = match fs::create_dir_all(&ctx.results_dir) {
            Ok(()) => {
                self.transfers
                    .receive_directory(
                        ctx.remote_dir.as_str(),
                        ctx.results_dir.as_str(),
                        node.connection(),
                        None,
                    )
                    .await
            }
            Err(e) => Err(TransferError::Invalid(vec![format!(
                "Cannot create result directory {}: {}",
                ctx.results_dir, e
            )])),
        };
        let phase = PhaseResult::from_transfer(&download, phase_started.elapsed());
        self.finish_phase(&mut result, Phase::FileTransferReceive, phase, hooks);
        match download {
            Ok(_) => result.output_files = list_files(&ctx.results_dir),
            Err(e) => {
                tracing::warn!(
                    job_id = job.id,
                    "Result download failed, completing without outputs: {}",
                    e
                );
                hooks.on_error(Some(Phase::FileTransferReceive), &e.to_string());
            }
        }

        self.set_status(job.id, &mut status, JobStatus::Completed, None, hooks);
        result.success = true;
        result.total_execution_time_ms = elapsed_ms(started);
        tracing::info!(
            job_id = job.id,
            elapsed_ms = result.total_execution_time_ms,
            outputs = result.output_files.len(),
            "Job completed"
        );
        result
    }

    /// Run the analysis script, forwarding output to the hooks as it arrives.
    ///
    /// Errors carry the exit code when the script ran.
    async fn run_analysis(
        &self,
        ctx: &ExecutionContext<'_>,
        hooks: &dyn ExecutionHooks,
    ) -> Result<Option<i32>, (Option<i32>, ExecutorError)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stderr_tx = tx.clone();

        let command = RemoteCommand::new(
            ctx.node.connection(),
            self.config.analysis_script.as_str(),
            vec![
                ctx.remote_dir.clone(),
                ctx.file.input_name().to_string(),
                ctx.job.name.clone(),
                ctx.job.cpu_cores.to_string(),
            ],
        )
        .with_encoding(self.config.encoding)
        .on(EventKind::Stdout, move |event| {
            if let CommandEvent::Stdout(text) = event {
                let _ = tx.send(OutputLine::Stdout(text.clone()));
            }
        })
        .on(EventKind::Stderr, move |event| {
            if let CommandEvent::Stderr(text) = event {
                let _ = stderr_tx.send(OutputLine::Stderr(text.clone()));
            }
        });

        let forward = async {
            let mut lines = LineSplitter::default();
            while let Some(output) = rx.recv().await {
                match output {
                    OutputLine::Stdout(text) => {
                        for line in lines.push(&text) {
                            stdout_line(&line, hooks);
                        }
                    }
                    OutputLine::Stderr(text) => hooks.on_stderr(&text),
                }
            }
            if let Some(line) = lines.finish() {
                stdout_line(&line, hooks);
            }
        };

        // The command owns both senders, so forwarding ends when it is dropped
        let (record, ()) = tokio::join!(self.runner.run(command), forward);

        match record {
            Ok(record) if record.success() => Ok(record.exit_code),
            Ok(record) => {
                let stderr = record.stderr.trim();
                let message = if !stderr.is_empty() {
                    stderr.to_string()
                } else {
                    match record.exit_code {
                        Some(code) => format!("exit code {}", code),
                        None => "terminated by signal".to_string(),
                    }
                };
                Err((record.exit_code, ExecutorError::Analysis(message)))
            }
            Err(e) => Err((None, ExecutorError::Command(e))),
        }
    }

    fn finish_phase(
        &self,
        result: &mut ExecutionResult,
        phase: Phase,
        outcome: PhaseResult,
        hooks: &dyn ExecutionHooks,
    ) {
        hooks.on_phase_complete(phase, &outcome);
        result.phases.set(phase, outcome);
    }

    fn fail(
        &self,
        mut result: ExecutionResult,
        status: &mut JobStatus,
        phase: Phase,
        error: ExecutorError,
        hooks: &dyn ExecutionHooks,
        started: Instant,
    ) -> ExecutionResult {
        let message = error.to_string();
        tracing::warn!(job_id = result.job_id, %phase, "Job failed: {}", message);
        hooks.on_error(Some(phase), &message);
        self.set_status(result.job_id, status, JobStatus::Failed, Some(&message), hooks);
        result.success = false;
        result.error_message = Some(message);
        result.total_execution_time_ms = elapsed_ms(started);
        result
    }

    /// Move the job along the transition table, persist, and publish.
    fn set_status(
        &self,
        job_id: JobId,
        current: &mut JobStatus,
        next: JobStatus,
        message: Option<&str>,
        hooks: &dyn ExecutionHooks,
    ) {
        if let Err(e) = validate_transition(*current, next) {
            tracing::warn!(job_id, "Skipping status update: {}", e);
            return;
        }

        let error_message = if next == JobStatus::Failed { message } else { None };
        if let Err(e) = self.jobs.update_job_status(job_id, next, error_message) {
            tracing::error!(job_id, status = %next, "Failed to persist job status: {}", e);
        }

        let now = Utc::now();
        let timestamp = match next {
            JobStatus::Starting => self.jobs.update_start_time(job_id, now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Missing => {
                self.jobs.update_end_time(job_id, now)
            }
            _ => Ok(()),
        };
        if let Err(e) = timestamp {
            tracing::error!(job_id, "Failed to persist job timestamp: {}", e);
        }

        *current = next;
        tracing::debug!(job_id, status = %next, "Job status changed");
        self.events.publish(
            JOBS_CHANNEL,
            JobEvent::status_changed(job_id, next, message.map(str::to_string)),
        );
        hooks.on_status_change(job_id, next, message);
    }
}

fn stdout_line(line: &str, hooks: &dyn ExecutionHooks) {
    hooks.on_stdout(line);
    if let Some(progress) = parse_progress(line) {
        hooks.on_progress(&progress);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Every regular file under `dir`, sorted.
fn list_files(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", current, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}
