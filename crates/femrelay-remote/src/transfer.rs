//! Directory transfer to and from worker nodes.
//!
//! Transfers go through the `sendDirectory` / `receiveDirectory` scripts, each
//! called with exactly `[source, destination]`. Calls against one node are
//! serialized through that node's queue.

use crate::command::{CommandError, RemoteCommand};
use crate::encoding::TextEncoding;
use crate::queue::{QueueError, QueueRegistry};
use crate::runner::RemoteRunner;
use femrelay_state::NodeConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SEND_SCRIPT: &str = "sendDirectory";
pub const RECEIVE_SCRIPT: &str = "receiveDirectory";

/// Phase name reported to hooks on transfer failures.
pub const TRANSFER_PHASE: &str = "transfer";

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid transfer options: {}", .0.join(", "))]
    Invalid(Vec<String>),
    /// The script ran and reported failure; the message is its diagnostic
    #[error("{message}")]
    Remote {
        message: String,
        exit_code: Option<i32>,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

impl TransferDirection {
    pub fn script_name(&self) -> &'static str {
        match self {
            TransferDirection::Send => SEND_SCRIPT,
            TransferDirection::Receive => RECEIVE_SCRIPT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub direction: TransferDirection,
    pub source_path: String,
    pub destination_path: String,
    pub connection: NodeConnection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub success: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Failure notice handed to [`TransferHooks::on_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub message: String,
    pub phase: &'static str,
}

/// Observer for one transfer. All methods default to doing nothing.
pub trait TransferHooks: Send + Sync {
    fn on_start(&self, _options: &TransferOptions) {}
    fn on_complete(&self, _result: &TransferResult) {}
    fn on_error(&self, _failure: &TransferFailure) {}
}

/// Non-empty checks on the options. Never fails; returns the problems found.
pub fn validate_transfer_options(options: &TransferOptions) -> Vec<String> {
    let mut errors = Vec::new();
    if options.source_path.trim().is_empty() {
        errors.push("Source path is required".to_string());
    }
    if options.destination_path.trim().is_empty() {
        errors.push("Destination path is required".to_string());
    }
    if options.connection.hostname.trim().is_empty() {
        errors.push("Hostname is required".to_string());
    }
    if options.connection.username.trim().is_empty() {
        errors.push("Username is required".to_string());
    }
    errors
}

#[derive(Clone)]
pub struct FileTransferService {
    runner: Arc<dyn RemoteRunner>,
    queues: Arc<QueueRegistry>,
    encoding: TextEncoding,
}

impl FileTransferService {
    pub fn new(runner: Arc<dyn RemoteRunner>, queues: Arc<QueueRegistry>) -> Self {
        Self {
            runner,
            queues,
            encoding: TextEncoding::default(),
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub async fn send_directory(
        &self,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        connection: NodeConnection,
        hooks: Option<&dyn TransferHooks>,
    ) -> Result<TransferResult, TransferError> {
        self.execute_transfer(
            TransferOptions {
                direction: TransferDirection::Send,
                source_path: source_path.into(),
                destination_path: destination_path.into(),
                connection,
            },
            hooks,
        )
        .await
    }

    pub async fn receive_directory(
        &self,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        connection: NodeConnection,
        hooks: Option<&dyn TransferHooks>,
    ) -> Result<TransferResult, TransferError> {
        self.execute_transfer(
            TransferOptions {
                direction: TransferDirection::Receive,
                source_path: source_path.into(),
                destination_path: destination_path.into(),
                connection,
            },
            hooks,
        )
        .await
    }

    /// Run one transfer through the node's queue.
    ///
    /// A non-zero exit is returned as [`TransferError::Remote`] carrying the
    /// script's stderr.
    pub async fn execute_transfer(
        &self,
        options: TransferOptions,
        hooks: Option<&dyn TransferHooks>,
    ) -> Result<TransferResult, TransferError> {
        let problems = validate_transfer_options(&options);
        if !problems.is_empty() {
            return Err(report_error(hooks, TransferError::Invalid(problems)));
        }

        if let Some(hooks) = hooks {
            hooks.on_start(&options);
        }

        let queue = self.queues.queue_for(&options.connection.queue_key());
        let runner = Arc::clone(&self.runner);
        let encoding = self.encoding;
        let script = options.direction.script_name();
        let command = RemoteCommand::new(
            options.connection.clone(),
            script,
            vec![options.source_path.clone(), options.destination_path.clone()],
        )
        .with_encoding(encoding);

        tracing::info!(
            direction = ?options.direction,
            host = %options.connection.hostname,
            source = %options.source_path,
            destination = %options.destination_path,
            "Queueing transfer"
        );

        let outcome = queue
            .push(async move {
                let started = Instant::now();
                let record = runner.run(command).await?;
                Ok::<_, CommandError>((record, started.elapsed()))
            })
            .await;

        let result = match outcome {
            Ok(Ok((record, elapsed))) if record.success() => Ok(TransferResult {
                success: true,
                elapsed,
                exit_code: record.exit_code,
                error_message: None,
            }),
            Ok(Ok((record, _))) => Err(TransferError::Remote {
                message: failure_message(&record.stderr, record.exit_code),
                exit_code: record.exit_code,
            }),
            Ok(Err(e)) => Err(TransferError::Command(e)),
            Err(e) => Err(TransferError::Queue(e)),
        };

        match result {
            Ok(result) => {
                tracing::info!(
                    script,
                    host = %options.connection.hostname,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Transfer completed"
                );
                if let Some(hooks) = hooks {
                    hooks.on_complete(&result);
                }
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(
                    script,
                    host = %options.connection.hostname,
                    "Transfer failed: {}",
                    e
                );
                Err(report_error(hooks, e))
            }
        }
    }
}

impl std::fmt::Debug for FileTransferService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferService")
            .field("queues", &self.queues)
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn failure_message(stderr: &str, exit_code: Option<i32>) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match exit_code {
        Some(code) => format!("Transfer failed with exit code {}", code),
        None => "Transfer failed: remote process was terminated".to_string(),
    }
}

fn report_error(hooks: Option<&dyn TransferHooks>, error: TransferError) -> TransferError {
    if let Some(hooks) = hooks {
        hooks.on_error(&TransferFailure {
            message: error.to_string(),
            phase: TRANSFER_PHASE,
        });
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueMode;
    use crate::runner::{ScriptedResponse, ScriptedRunner};
    use std::sync::Mutex;

    fn service(runner: Arc<ScriptedRunner>) -> FileTransferService {
        FileTransferService::new(runner, Arc::new(QueueRegistry::new(QueueMode::PerNode)))
    }

    fn options(direction: TransferDirection) -> TransferOptions {
        TransferOptions {
            direction,
            source_path: "/a".to_string(),
            destination_path: "/b".to_string(),
            connection: NodeConnection::new("h", "u", 22),
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
    }

    impl TransferHooks for RecordingHooks {
        fn on_start(&self, options: &TransferOptions) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start:{}", options.direction.script_name()));
        }
        fn on_complete(&self, _result: &TransferResult) {
            self.calls.lock().unwrap().push("complete".to_string());
        }
        fn on_error(&self, failure: &TransferFailure) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("error:{}:{}", failure.phase, failure.message));
        }
    }

    #[tokio::test]
    async fn test_send_uses_send_script_and_param_order() {
        let runner = Arc::new(ScriptedRunner::default());
        let transfers = service(Arc::clone(&runner));

        let result = transfers
            .execute_transfer(options(TransferDirection::Send), None)
            .await
            .unwrap();
        assert!(result.success);

        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].script.contains("sendDirectory"));
        assert_eq!(calls[0].parameters, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_receive_changes_only_script() {
        let runner = Arc::new(ScriptedRunner::default());
        let transfers = service(Arc::clone(&runner));

        transfers
            .execute_transfer(options(TransferDirection::Receive), None)
            .await
            .unwrap();

        let calls = runner.invocations();
        assert_eq!(calls[0].script, "receiveDirectory");
        assert_eq!(calls[0].parameters, vec!["/a", "/b"]);
        assert_eq!(calls[0].connection, NodeConnection::new("h", "u", 22));
    }

    #[tokio::test]
    async fn test_stderr_becomes_error_message() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond(
            SEND_SCRIPT,
            ScriptedResponse::exit(1).with_stderr("Access denied\n"),
        );
        let transfers = service(Arc::clone(&runner));
        let hooks = RecordingHooks::default();

        let err = transfers
            .execute_transfer(options(TransferDirection::Send), Some(&hooks))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Access denied");
        assert_eq!(
            *hooks.calls.lock().unwrap(),
            vec!["start:sendDirectory", "error:transfer:Access denied"]
        );
    }

    #[tokio::test]
    async fn test_empty_stderr_gives_generic_message() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond(SEND_SCRIPT, ScriptedResponse::exit(1));
        let transfers = service(Arc::clone(&runner));

        let err = transfers
            .execute_transfer(options(TransferDirection::Send), None)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Transfer failed"));
        assert!(matches!(err, TransferError::Remote { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_success_calls_complete_hook() {
        let transfers = service(Arc::new(ScriptedRunner::default()));
        let hooks = RecordingHooks::default();

        transfers
            .send_directory("/a", "/b", NodeConnection::new("h", "u", 22), Some(&hooks))
            .await
            .unwrap();

        assert_eq!(
            *hooks.calls.lock().unwrap(),
            vec!["start:sendDirectory", "complete"]
        );
    }

    #[tokio::test]
    async fn test_invalid_options_never_reach_runner() {
        let runner = Arc::new(ScriptedRunner::default());
        let transfers = service(Arc::clone(&runner));
        let mut bad = options(TransferDirection::Send);
        bad.source_path = " ".to_string();
        bad.connection.username = String::new();

        let err = transfers.execute_transfer(bad, None).await.unwrap_err();

        assert!(matches!(err, TransferError::Invalid(ref problems) if problems.len() == 2));
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new(ScriptedResponse::spawn_failure(
            "ssh: not found",
        )));
        let transfers = service(runner);

        let err = transfers
            .execute_transfer(options(TransferDirection::Send), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Command(CommandError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_same_node_transfers_never_overlap() {
        let runner = Arc::new(ScriptedRunner::new(
            ScriptedResponse::ok().with_delay(std::time::Duration::from_millis(5)),
        ));
        let transfers = service(Arc::clone(&runner));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transfers = transfers.clone();
            handles.push(tokio::spawn(async move {
                transfers
                    .execute_transfer(options(TransferDirection::Send), None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(runner.invocations().len(), 4);
        assert_eq!(runner.peak_concurrency("h:22"), 1);
    }

    #[test]
    fn test_validate_transfer_options() {
        assert!(validate_transfer_options(&options(TransferDirection::Send)).is_empty());

        let empty = TransferOptions {
            direction: TransferDirection::Receive,
            source_path: String::new(),
            destination_path: String::new(),
            connection: NodeConnection::new("", "", 22),
        };
        assert_eq!(
            validate_transfer_options(&empty),
            vec![
                "Source path is required",
                "Destination path is required",
                "Hostname is required",
                "Username is required",
            ]
        );
    }
}
