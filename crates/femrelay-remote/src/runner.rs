//! Seam between orchestration code and actual process spawning.

use crate::command::{CommandError, CommandEvent, ExecutionRecord, RemoteCommand, ScriptTransport};
use async_trait::async_trait;
use femrelay_state::NodeConnection;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Runs a prepared [`RemoteCommand`] to completion.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, command: RemoteCommand) -> Result<ExecutionRecord, CommandError>;
}

/// Spawns scripts through a [`ScriptTransport`].
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    transport: ScriptTransport,
}

impl ScriptRunner {
    pub fn new(transport: ScriptTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &ScriptTransport {
        &self.transport
    }
}

#[async_trait]
impl RemoteRunner for ScriptRunner {
    async fn run(&self, command: RemoteCommand) -> Result<ExecutionRecord, CommandError> {
        command.invoke_async(&self.transport).await
    }
}

/// Canned reply for a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedResponse {
    pub exit_code: Option<i32>,
    /// Emitted as separate stdout chunks
    pub stdout: Vec<String>,
    pub stderr: String,
    /// Fail as if the process could not be spawned
    pub spawn_error: Option<String>,
    pub delay: Duration,
}

impl ScriptedResponse {
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            stdout: Vec::new(),
            stderr: String::new(),
            spawn_error: None,
            delay: Duration::ZERO,
        }
    }

    pub fn spawn_failure(error: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(error.into()),
            ..Self::ok()
        }
    }

    pub fn with_stdout<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdout = chunks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A recorded call made against a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub script: String,
    pub parameters: Vec<String>,
    pub connection: NodeConnection,
}

#[derive(Debug, Default)]
struct ScriptedState {
    responses: HashMap<String, VecDeque<ScriptedResponse>>,
    invocations: Vec<Invocation>,
    in_flight: HashMap<String, usize>,
    peak_in_flight: HashMap<String, usize>,
}

/// Runner that never spawns anything.
///
/// Replies come from per-script queues of canned responses, falling back to a
/// default. Backs `--dry-run` and stands in for real hosts in tests.
#[derive(Debug)]
pub struct ScriptedRunner {
    default: ScriptedResponse,
    state: Mutex<ScriptedState>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new(ScriptedResponse::ok())
    }
}

impl ScriptedRunner {
    pub fn new(default: ScriptedResponse) -> Self {
        Self {
            default,
            state: Mutex::new(ScriptedState::default()),
        }
    }

    /// Queue a reply for the next call of `script`.
    pub fn respond(&self, script: &str, response: ScriptedResponse) -> &Self {
        self.lock()
            .responses
            .entry(script.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn invocations_of(&self, script: &str) -> Vec<Invocation> {
        self.lock()
            .invocations
            .iter()
            .filter(|i| i.script == script)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous calls seen against one `hostname:port`.
    pub fn peak_concurrency(&self, queue_key: &str) -> usize {
        self.lock()
            .peak_in_flight
            .get(queue_key)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, command: &RemoteCommand) -> ScriptedResponse {
        let key = command.connection().queue_key();
        let mut state = self.lock();
        state.invocations.push(Invocation {
            script: command.script().to_string(),
            parameters: command.parameters().to_vec(),
            connection: command.connection().clone(),
        });

        let in_flight = {
            let count = state.in_flight.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let peak = state.peak_in_flight.entry(key).or_insert(0);
        *peak = (*peak).max(in_flight);

        state
            .responses
            .get_mut(command.script())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }

    fn end(&self, command: &RemoteCommand) {
        let key = command.connection().queue_key();
        if let Some(count) = self.lock().in_flight.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl RemoteRunner for ScriptedRunner {
    async fn run(&self, command: RemoteCommand) -> Result<ExecutionRecord, CommandError> {
        let response = self.begin(&command);

        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        self.end(&command);

        if let Some(error) = response.spawn_error {
            command.emit(&CommandEvent::Error(error.clone()));
            return Err(CommandError::Spawn {
                script: command.script().to_string(),
                error,
            });
        }

        command.emit(&CommandEvent::Start {
            script: command.script().to_string(),
            host: command.connection().hostname.clone(),
        });
        for chunk in &response.stdout {
            command.emit(&CommandEvent::Stdout(chunk.clone()));
        }
        if !response.stderr.is_empty() {
            command.emit(&CommandEvent::Stderr(response.stderr.clone()));
        }

        let last_output = if response.stderr.is_empty() {
            response.stdout.last().cloned().unwrap_or_default()
        } else {
            response.stderr.clone()
        };
        let record = ExecutionRecord {
            exit_code: response.exit_code,
            stdout: response.stdout.concat(),
            stderr: response.stderr,
            last_output,
            elapsed: response.delay,
        };
        command.emit(&CommandEvent::Finish(record.clone()));
        Ok(record)
    }
}
