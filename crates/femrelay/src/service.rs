//! Wiring for `femrelay run`.

use femrelay_cli::RunArgs;
use femrelay_exec::JobExecutor;
use femrelay_remote::{
    FileTransferService, QueueRegistry, RemoteRunner, ScriptRunner, ScriptedRunner,
};
use femrelay_sched::JobExecutionScheduler;
use femrelay_state::{JobStatus, NodeStatus};
use femrelay_store::{
    BroadcastBus, EventPublisher, FileRepository, JobRepository, MemoryStore, NodeRepository,
};
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub async fn run(args: RunArgs) -> Result<()> {
    let scheduler_config = args.scheduler_config().into_diagnostic()?;
    let executor_config = args.executor_config().into_diagnostic()?;
    let state_file = args.state.state_file.clone();

    let store = Arc::new(MemoryStore::load(&state_file).into_diagnostic()?);
    log_inventory(&store)?;

    let bus = Arc::new(BroadcastBus::default());
    let event_log = spawn_event_log(&bus);

    let runner: Arc<dyn RemoteRunner> = if args.dry_run {
        tracing::warn!("Dry run: remote scripts are simulated");
        Arc::new(ScriptedRunner::default())
    } else {
        let transport = args.transport();
        tracing::info!(
            scripts_dir = %transport.scripts_dir,
            interpreter = %transport.interpreter,
            "Using local transport scripts"
        );
        Arc::new(ScriptRunner::new(transport))
    };

    let queues = Arc::new(QueueRegistry::new(args.queue_mode.into()));
    let transfers = FileTransferService::new(Arc::clone(&runner), queues)
        .with_encoding(executor_config.encoding);
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store) as Arc<dyn JobRepository>,
        Arc::clone(&bus) as Arc<dyn EventPublisher>,
        transfers,
        runner,
        executor_config,
    ));
    let scheduler = JobExecutionScheduler::new(
        Arc::clone(&store) as Arc<dyn JobRepository>,
        Arc::clone(&store) as Arc<dyn NodeRepository>,
        Arc::clone(&store) as Arc<dyn FileRepository>,
        Arc::clone(&bus) as Arc<dyn EventPublisher>,
        executor,
        scheduler_config,
    )
    .into_diagnostic()?;

    // Pick up whatever is already waiting instead of idling a full interval
    if let Err(e) = scheduler.tick() {
        tracing::error!("Initial dispatch failed: {}", e);
    }

    scheduler.start().into_diagnostic()?;
    scheduler.interval().enable_graceful_shutdown();
    if let Some(every) = args.stats_interval() {
        scheduler.interval().enable_periodic_stats_logging(every);
    }

    scheduler.interval().join().await;
    scheduler.shutdown().await;

    store.save(&state_file).into_diagnostic()?;
    tracing::info!(path = %state_file, "Saved state");
    event_log.abort();
    Ok(())
}

fn log_inventory(store: &MemoryStore) -> Result<()> {
    let data = store.snapshot().into_diagnostic()?;
    let waiting = data
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Waiting)
        .count();
    let available = data
        .nodes
        .iter()
        .filter(|n| n.is_active && n.status == NodeStatus::Available)
        .count();
    tracing::info!(
        jobs = data.jobs.len(),
        waiting,
        nodes = data.nodes.len(),
        available,
        files = data.files.len(),
        "Loaded state"
    );
    Ok(())
}

/// Log every event published on the bus.
fn spawn_event_log(bus: &BroadcastBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(message) => {
                    let femrelay_state::JobEvent::JobStatusChanged(change) = message.event;
                    tracing::info!(
                        channel = %message.channel,
                        job_id = change.job_id,
                        status = %change.status,
                        message = change.message.as_deref().unwrap_or(""),
                        "Job status changed"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
