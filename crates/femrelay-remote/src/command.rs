//! Invocation of one remote script with observable lifecycle events.
//!
//! Scripts run locally through an interpreter and reach the worker host over
//! the remote shell themselves; the host, user and port are exported to them
//! as environment variables. Exit codes are reported, never interpreted here.

use crate::encoding::{StreamDecoder, TextEncoding};
use camino::{Utf8Path, Utf8PathBuf};
use femrelay_state::NodeConnection;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

pub const ENV_HOST: &str = "FEMRELAY_HOST";
pub const ENV_USER: &str = "FEMRELAY_USER";
pub const ENV_PORT: &str = "FEMRELAY_PORT";

const READ_CHUNK: usize = 8192;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn {script}: {error}")]
    Spawn { script: String, error: String },
    #[error("I/O error while running {script}: {error}")]
    Io { script: String, error: String },
}

/// The five lifecycle event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Stdout,
    Stderr,
    Error,
    Finish,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Start { script: String, host: String },
    Stdout(String),
    Stderr(String),
    Error(String),
    Finish(ExecutionRecord),
}

impl CommandEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CommandEvent::Start { .. } => EventKind::Start,
            CommandEvent::Stdout(_) => EventKind::Stdout,
            CommandEvent::Stderr(_) => EventKind::Stderr,
            CommandEvent::Error(_) => EventKind::Error,
            CommandEvent::Finish(_) => EventKind::Finish,
        }
    }
}

/// Outcome of a completed invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionRecord {
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Most recent decoded chunk from either stream
    pub last_output: String,
    pub elapsed: Duration,
}

impl ExecutionRecord {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How script identifiers map to local processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTransport {
    pub scripts_dir: Utf8PathBuf,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Appended to the script identifier, e.g. `.sh` or `.ps1`
    pub extension: String,
}

impl Default for ScriptTransport {
    fn default() -> Self {
        Self {
            scripts_dir: Utf8PathBuf::from("scripts"),
            interpreter: "bash".to_string(),
            interpreter_args: Vec::new(),
            extension: ".sh".to_string(),
        }
    }
}

impl ScriptTransport {
    pub fn script_path(&self, script: &str) -> Utf8PathBuf {
        self.scripts_dir.join(format!("{}{}", script, self.extension))
    }
}

type Listener = Arc<dyn Fn(&CommandEvent) + Send + Sync>;

/// One remote script invocation.
pub struct RemoteCommand {
    connection: NodeConnection,
    script: String,
    parameters: Vec<String>,
    encoding: TextEncoding,
    listeners: Vec<(EventKind, Listener)>,
}

impl RemoteCommand {
    pub fn new(
        connection: NodeConnection,
        script: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            connection,
            script: script.into(),
            parameters,
            encoding: TextEncoding::default(),
            listeners: Vec::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Register a listener for one event kind.
    pub fn on<F>(mut self, kind: EventKind, listener: F) -> Self
    where
        F: Fn(&CommandEvent) + Send + Sync + 'static,
    {
        self.listeners.push((kind, Arc::new(listener)));
        self
    }

    pub fn connection(&self) -> &NodeConnection {
        &self.connection
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Deliver an event to every listener registered for its kind.
    pub fn emit(&self, event: &CommandEvent) {
        let kind = event.kind();
        for (_, listener) in self.listeners.iter().filter(|(k, _)| *k == kind) {
            listener(event);
        }
    }

    /// Start the invocation in the background; observe it through listeners.
    pub fn invoke(
        self,
        transport: &ScriptTransport,
    ) -> JoinHandle<Result<ExecutionRecord, CommandError>> {
        let transport = transport.clone();
        tokio::spawn(async move { self.run(&transport).await })
    }

    /// Run to completion.
    ///
    /// Resolves with the `finish` record whatever the exit code; only spawn and
    /// stream failures are errors.
    pub async fn invoke_async(
        self,
        transport: &ScriptTransport,
    ) -> Result<ExecutionRecord, CommandError> {
        self.run(transport).await
    }

    async fn run(&self, transport: &ScriptTransport) -> Result<ExecutionRecord, CommandError> {
        let started = Instant::now();
        let script_path = transport.script_path(&self.script);

        let mut cmd = self.build(transport, &script_path);
        tracing::debug!(
            script = %self.script,
            host = %self.connection.hostname,
            params = ?self.parameters,
            "Invoking remote script"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.fail_spawn(e.to_string())),
        };

        self.emit(&CommandEvent::Start {
            script: self.script.clone(),
            host: self.connection.hostname.clone(),
        });

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(self.fail_spawn("stdio pipes unavailable".to_string()));
        };

        let last_output = Mutex::new(String::new());
        let (stdout, stderr) = tokio::join!(
            self.pump(stdout, CommandEvent::Stdout, &last_output),
            self.pump(stderr, CommandEvent::Stderr, &last_output),
        );
        let (stdout, stderr) = match (stdout, stderr) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => return Err(self.fail_io(e)),
        };

        let status = child.wait().await.map_err(|e| self.fail_io(e))?;

        let record = ExecutionRecord {
            exit_code: status.code(),
            stdout,
            stderr,
            last_output: last_output
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            elapsed: started.elapsed(),
        };

        tracing::debug!(
            script = %self.script,
            exit_code = ?record.exit_code,
            elapsed_ms = record.elapsed.as_millis() as u64,
            "Remote script finished"
        );
        self.emit(&CommandEvent::Finish(record.clone()));
        Ok(record)
    }

    fn build(&self, transport: &ScriptTransport, script_path: &Utf8Path) -> Command {
        let mut cmd = Command::new(&transport.interpreter);
        cmd.args(&transport.interpreter_args)
            .arg(script_path.as_str())
            .args(&self.parameters)
            .env(ENV_HOST, &self.connection.hostname)
            .env(ENV_USER, &self.connection.username)
            .env(ENV_PORT, self.connection.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Decode one stream chunk by chunk, emitting an event per chunk.
    async fn pump<R>(
        &self,
        mut reader: R,
        wrap: fn(String) -> CommandEvent,
        last_output: &Mutex<String>,
    ) -> std::io::Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder: StreamDecoder = self.encoding.stream_decoder();
        let mut collected = String::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut buf).await?;
            let text = if n == 0 {
                decoder.finish()
            } else {
                decoder.feed(&buf[..n])
            };

            if !text.is_empty() {
                collected.push_str(&text);
                *last_output.lock().unwrap_or_else(PoisonError::into_inner) = text.clone();
                self.emit(&wrap(text));
            }

            if n == 0 {
                return Ok(collected);
            }
        }
    }

    fn fail_spawn(&self, error: String) -> CommandError {
        self.emit(&CommandEvent::Error(error.clone()));
        CommandError::Spawn {
            script: self.script.clone(),
            error,
        }
    }

    fn fail_io(&self, error: std::io::Error) -> CommandError {
        self.emit(&CommandEvent::Error(error.to_string()));
        CommandError::Io {
            script: self.script.clone(),
            error: error.to_string(),
        }
    }
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("connection", &self.connection)
            .field("script", &self.script)
            .field("parameters", &self.parameters)
            .field("encoding", &self.encoding)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
