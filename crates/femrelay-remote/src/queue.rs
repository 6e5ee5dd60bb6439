//! Serialized execution of async operations against a shared resource.
//!
//! A [`SerialQueue`] runs pushed futures one at a time in push order. The order
//! is fixed when `push` is called, before the caller ever awaits, so tasks with
//! random latencies still complete in submission order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queued task panicked or was aborted before completing")]
    TaskAborted,
}

type QueuedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct QueueState {
    running: bool,
    tasks: VecDeque<QueuedTask>,
}

/// FIFO async mutex.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct SerialQueue {
    state: Arc<Mutex<QueueState>>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task and get a future for its output.
    ///
    /// The task is queued immediately, even if the returned future is never
    /// awaited. A failing or panicking task only affects its own result.
    /// Must be called from within a tokio runtime.
    pub fn push<F>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<F::Output, QueueError>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued: QueuedTask = Box::pin(async move {
            // Receiver may have been dropped; the task still ran in order
            let _ = tx.send(task.await);
        });

        let start_drain = {
            let mut state = lock(&self.state);
            state.tasks.push_back(queued);
            !std::mem::replace(&mut state.running, true)
        };

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.state)));
        }

        async move { rx.await.map_err(|_| QueueError::TaskAborted) }
    }

    /// A drain loop is active.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Tasks waiting for their turn (not counting the one executing).
    pub fn pending(&self) -> usize {
        lock(&self.state).tasks.len()
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SerialQueue")
            .field("running", &state.running)
            .field("pending", &state.tasks.len())
            .finish()
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    // The state is two plain fields, valid even after a panic elsewhere
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain(state: Arc<Mutex<QueueState>>) {
    loop {
        let next = {
            let mut guard = lock(&state);
            match guard.tasks.pop_front() {
                Some(task) => task,
                None => {
                    guard.running = false;
                    return;
                }
            }
        };

        // Run on its own task so a panic surfaces as a JoinError here
        if let Err(e) = tokio::spawn(next).await {
            tracing::warn!("Queued task did not complete: {}", e);
        }
    }
}

/// How transfer queues are shared between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// One queue per `hostname:port`
    #[default]
    PerNode,
    /// Every node shares a single queue
    Global,
}

/// Owned map from resource key to its queue.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    mode: QueueMode,
    global: SerialQueue,
    queues: Mutex<HashMap<String, SerialQueue>>,
}

impl QueueRegistry {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Queue guarding `key`, created on first use.
    pub fn queue_for(&self, key: &str) -> SerialQueue {
        match self.mode {
            QueueMode::Global => self.global.clone(),
            QueueMode::PerNode => {
                let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
                queues.entry(key.to_string()).or_default().clone()
            }
        }
    }

    /// Number of per-node queues created so far.
    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
