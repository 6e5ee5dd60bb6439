//! CLI argument parsing for femrelay.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use femrelay_exec::ExecutorConfig;
use femrelay_remote::{QueueMode, ScriptTransport, TextEncoding, UnknownEncoding};
use femrelay_sched::{NodeSelection, SchedulerConfig};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Encoding(#[from] UnknownEncoding),
    #[error("--{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Parser, Debug)]
#[command(name = "femrelay")]
#[command(version, about = "Dispatch finite-element analysis jobs to remote worker nodes")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter, e.g. `debug` or `femrelay_sched=trace` (overrides RUST_LOG)
    #[arg(long, global = true, env = "FEMRELAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the job scheduler until interrupted
    Run(RunArgs),
    /// Show how every node matches a job's requirements
    Check(CheckArgs),
    /// List the statuses a job may move to from STATUS
    Transitions {
        /// waiting, starting, running, completed, failed or missing
        status: String,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct StateArgs {
    /// JSON file holding jobs, nodes and input files
    #[arg(long, env = "FEMRELAY_STATE_FILE", default_value = "femrelay-state.json")]
    pub state_file: Utf8PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CheckArgs {
    /// Job to match against the nodes
    pub job_id: i64,

    #[command(flatten)]
    pub state: StateArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Seconds between polls while idle
    #[arg(long, env = "FEMRELAY_CHECK_INTERVAL", default_value = "30")]
    pub check_interval: u64,

    /// Seconds between polls while jobs are running
    #[arg(long, env = "FEMRELAY_BUSY_CHECK_INTERVAL", default_value = "10")]
    pub busy_check_interval: u64,

    /// Maximum number of jobs executing at once
    #[arg(long, env = "FEMRELAY_MAX_CONCURRENT_JOBS", default_value = "3")]
    pub max_concurrent_jobs: usize,

    /// Seconds before a failed job is tried again
    #[arg(long, env = "FEMRELAY_RETRY_INTERVAL", default_value = "60")]
    pub retry_interval: u64,

    /// Failures after which a job is given up on
    #[arg(long, env = "FEMRELAY_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Character encoding of remote script output
    #[arg(long, env = "FEMRELAY_ENCODING", default_value = "utf-8")]
    pub encoding: String,

    /// Directory holding sendDirectory, receiveDirectory and executeAbaqus
    #[arg(long, env = "FEMRELAY_SCRIPTS_DIR", default_value = "scripts")]
    pub scripts_dir: Utf8PathBuf,

    /// Program the scripts are run with
    #[arg(long, env = "FEMRELAY_INTERPRETER", default_value = "bash")]
    pub interpreter: String,

    /// Extra interpreter argument, placed before the script path (repeatable)
    #[arg(long = "interpreter-arg", allow_hyphen_values = true)]
    pub interpreter_args: Vec<String>,

    /// File extension of the scripts
    #[arg(long, env = "FEMRELAY_SCRIPT_EXTENSION", default_value = ".sh")]
    pub script_extension: String,

    /// Root of job working directories on the nodes
    #[arg(long, env = "FEMRELAY_REMOTE_ROOT", default_value = "/scratch/femrelay")]
    pub remote_root: String,

    /// Local directory results are downloaded into
    #[arg(long, env = "FEMRELAY_RESULTS_DIR", default_value = "results")]
    pub results_dir: Utf8PathBuf,

    /// How transfers are serialized
    #[arg(long, value_enum, default_value_t = QueueModeArg::PerNode)]
    pub queue_mode: QueueModeArg,

    /// How a node is chosen for a job without a usable assigned node
    #[arg(long, value_enum, default_value_t = NodeSelectionArg::FirstFit)]
    pub node_selection: NodeSelectionArg,

    /// Seconds between scheduler stats log lines (0 disables)
    #[arg(long, default_value = "300")]
    pub stats_interval: u64,

    /// Simulate remote scripts instead of running them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueModeArg {
    PerNode,
    Global,
}

impl From<QueueModeArg> for QueueMode {
    fn from(arg: QueueModeArg) -> Self {
        match arg {
            QueueModeArg::PerNode => QueueMode::PerNode,
            QueueModeArg::Global => QueueMode::Global,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelectionArg {
    FirstFit,
    Optimal,
}

impl From<NodeSelectionArg> for NodeSelection {
    fn from(arg: NodeSelectionArg) -> Self {
        match arg {
            NodeSelectionArg::FirstFit => NodeSelection::FirstFit,
            NodeSelectionArg::Optimal => NodeSelection::Optimal,
        }
    }
}

fn seconds(value: u64, flag: &'static str) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(flag));
    }
    Ok(Duration::from_secs(value))
}

impl RunArgs {
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Zero("max-concurrent-jobs"));
        }
        Ok(SchedulerConfig {
            check_interval: seconds(self.check_interval, "check-interval")?,
            busy_check_interval: seconds(self.busy_check_interval, "busy-check-interval")?,
            max_concurrent_jobs: self.max_concurrent_jobs,
            retry_interval: Duration::from_secs(self.retry_interval),
            max_retries: self.max_retries,
            node_selection: self.node_selection.into(),
        })
    }

    pub fn encoding(&self) -> Result<TextEncoding, ConfigError> {
        Ok(TextEncoding::for_label(&self.encoding)?)
    }

    pub fn executor_config(&self) -> Result<ExecutorConfig, ConfigError> {
        Ok(ExecutorConfig {
            remote_root: self.remote_root.clone(),
            results_root: self.results_dir.clone(),
            encoding: self.encoding()?,
            ..ExecutorConfig::default()
        })
    }

    pub fn transport(&self) -> ScriptTransport {
        ScriptTransport {
            scripts_dir: self.scripts_dir.clone(),
            interpreter: self.interpreter.clone(),
            interpreter_args: self.interpreter_args.clone(),
            extension: self.script_extension.clone(),
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["femrelay", "run"];
        argv.extend_from_slice(extra);
        match Args::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_defaults() {
        let args = run_args(&[]);
        let config = args.scheduler_config().unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.busy_check_interval, Duration::from_secs(10));
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.node_selection, NodeSelection::FirstFit);
        assert_eq!(QueueMode::from(args.queue_mode), QueueMode::PerNode);
        assert_eq!(args.transport(), ScriptTransport::default());
        assert_eq!(args.stats_interval(), Some(Duration::from_secs(300)));
        assert!(!args.dry_run);
    }

    #[test]
    fn test_run_overrides() {
        let args = run_args(&[
            "--check-interval",
            "5",
            "--queue-mode",
            "global",
            "--node-selection",
            "optimal",
            "--encoding",
            "shift_jis",
            "--interpreter",
            "pwsh",
            "--interpreter-arg",
            "-File",
            "--script-extension",
            ".ps1",
            "--stats-interval",
            "0",
        ]);
        assert_eq!(args.scheduler_config().unwrap().check_interval, Duration::from_secs(5));
        assert_eq!(QueueMode::from(args.queue_mode), QueueMode::Global);
        assert_eq!(NodeSelection::from(args.node_selection), NodeSelection::Optimal);
        assert_eq!(args.executor_config().unwrap().encoding.name(), "Shift_JIS");
        assert_eq!(args.transport().script_path("sendDirectory"), "scripts/sendDirectory.ps1");
        assert_eq!(args.transport().interpreter_args, vec!["-File"]);
        assert!(args.stats_interval().is_none());
    }

    #[test]
    fn test_invalid_values() {
        let args = run_args(&["--check-interval", "0"]);
        assert!(matches!(args.scheduler_config(), Err(ConfigError::Zero("check-interval"))));

        let args = run_args(&["--encoding", "klingon"]);
        assert!(args.executor_config().is_err());

        assert!(Args::try_parse_from(["femrelay", "run", "--queue-mode", "sometimes"]).is_err());
    }

    #[test]
    fn test_check_and_transitions() {
        let args =
            Args::try_parse_from(["femrelay", "check", "42", "--state-file", "s.json"]).unwrap();
        match args.command {
            Command::Check(check) => {
                assert_eq!(check.job_id, 42);
                assert_eq!(check.state.state_file, "s.json");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args =
            Args::try_parse_from(["femrelay", "--log-level", "debug", "transitions", "running"])
                .unwrap();
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(matches!(args.command, Command::Transitions { ref status } if status == "running"));
    }
}
