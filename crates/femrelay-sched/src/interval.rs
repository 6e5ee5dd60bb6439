//! Generic fixed-interval scheduler.
//!
//! Runs one async tick body repeatedly. Ticks never overlap: the delay before
//! the next tick starts only after the previous body has returned. Failing
//! ticks are counted and back the next delay off exponentially.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound of the failure backoff multiplier.
pub const MAX_BACKOFF_FACTOR: u32 = 16;

pub type TickError = Box<dyn std::error::Error + Send + Sync>;
pub type TickFuture = Pin<Box<dyn Future<Output = Result<(), TickError>> + Send>>;
type TickCallback = Arc<dyn Fn() -> TickFuture + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler name must not be empty")]
    EmptyName,
    #[error("Scheduler interval must be greater than zero")]
    ZeroInterval,
    #[error("Scheduler {0} has no tick callback registered")]
    NoCallback(String),
}

/// Point-in-time view of a scheduler's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub name: String,
    pub is_running: bool,
    pub interval_ms: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub consecutive_failures: u32,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    consecutive_failures: u32,
    last_execution: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Control {
    running: bool,
    /// Cancelled by `stop`; replaced by the next `start`
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    interval: Mutex<Duration>,
    callback: Mutex<Option<TickCallback>>,
    counters: Mutex<Counters>,
    control: Mutex<Control>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap handle to a named interval loop.
#[derive(Clone)]
pub struct IntervalScheduler {
    inner: Arc<Inner>,
}

/// Non-owning handle, for tick bodies that adjust their own scheduler.
#[derive(Clone)]
pub struct WeakIntervalScheduler {
    inner: Weak<Inner>,
}

impl WeakIntervalScheduler {
    pub fn upgrade(&self) -> Option<IntervalScheduler> {
        self.inner.upgrade().map(|inner| IntervalScheduler { inner })
    }
}

impl IntervalScheduler {
    pub fn new(name: impl Into<String>, interval: Duration) -> Result<Self, SchedulerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SchedulerError::EmptyName);
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                interval: Mutex::new(interval),
                callback: Mutex::new(None),
                counters: Mutex::new(Counters::default()),
                control: Mutex::new(Control {
                    running: false,
                    token: CancellationToken::new(),
                    handle: None,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakIntervalScheduler {
        WeakIntervalScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the tick body, replacing any previous one.
    pub fn on_tick<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TickError>> + Send + 'static,
    {
        let callback: TickCallback = Arc::new(move || Box::pin(callback()) as TickFuture);
        *lock(&self.inner.callback) = Some(callback);
    }

    /// Start the loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if lock(&self.inner.callback).is_none() {
            return Err(SchedulerError::NoCallback(self.inner.name.clone()));
        }

        let mut control = lock(&self.inner.control);
        if control.running {
            tracing::debug!(scheduler = %self.inner.name, "Scheduler already running");
            return Ok(());
        }
        if control.token.is_cancelled() {
            control.token = CancellationToken::new();
        }
        control.running = true;

        let inner = Arc::clone(&self.inner);
        let token = control.token.clone();
        control.handle = Some(tokio::spawn(run_loop(inner, token)));

        tracing::info!(
            scheduler = %self.inner.name,
            interval_ms = self.interval().as_millis() as u64,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the loop. A tick in progress runs to completion.
    pub fn stop(&self) {
        {
            let mut control = lock(&self.inner.control);
            if !control.running {
                return;
            }
            control.running = false;
            control.token.cancel();
        }

        let stats = self.stats();
        tracing::info!(
            scheduler = %stats.name,
            total = stats.total_executions,
            successful = stats.successful_executions,
            failed = stats.failed_executions,
            "Scheduler stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.control).running
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.inner.interval)
    }

    /// Change the base delay used for subsequent ticks.
    pub fn set_interval(&self, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        let mut current = lock(&self.inner.interval);
        if *current != interval {
            tracing::debug!(
                scheduler = %self.inner.name,
                interval_ms = interval.as_millis() as u64,
                "Scheduler interval changed"
            );
            *current = interval;
        }
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = lock(&self.inner.counters);
        SchedulerStats {
            name: self.inner.name.clone(),
            is_running: self.is_running(),
            interval_ms: self.interval().as_millis() as u64,
            total_executions: counters.total,
            successful_executions: counters.successful,
            failed_executions: counters.failed,
            consecutive_failures: counters.consecutive_failures,
            last_execution: counters.last_execution,
            last_error: counters.last_error.clone(),
        }
    }

    /// Wait for the loop task to exit.
    pub async fn join(&self) {
        let handle = lock(&self.inner.control).handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(
                    scheduler = %self.inner.name,
                    "Scheduler loop ended abnormally: {}",
                    e
                );
            }
        }
    }

    /// Stop the scheduler on SIGINT or SIGTERM.
    pub fn enable_graceful_shutdown(&self) -> JoinHandle<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let scheduler = self.clone();
        let token = self.lifecycle_token();
        tokio::spawn(async move {
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::error!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = token.cancelled() => return,
            }

            scheduler.stop();
        })
    }

    /// Log the counters every `every` until the scheduler stops.
    pub fn enable_periodic_stats_logging(&self, every: Duration) -> JoinHandle<()> {
        let scheduler = self.downgrade();
        let token = self.lifecycle_token();
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                let stats = scheduler.stats();
                tracing::info!(
                    scheduler = %stats.name,
                    total = stats.total_executions,
                    successful = stats.successful_executions,
                    failed = stats.failed_executions,
                    consecutive_failures = stats.consecutive_failures,
                    "Scheduler stats"
                );
            }
        })
    }

    /// Token of the current (or next) run.
    fn lifecycle_token(&self) -> CancellationToken {
        let mut control = lock(&self.inner.control);
        if control.token.is_cancelled() && !control.running {
            control.token = CancellationToken::new();
        }
        control.token.clone()
    }
}

impl Inner {
    /// Base interval scaled by the failure backoff.
    fn next_delay(&self) -> Duration {
        let failures = lock(&self.counters).consecutive_failures;
        let factor = 2u32.saturating_pow(failures).min(MAX_BACKOFF_FACTOR);
        lock(&self.interval).saturating_mul(factor)
    }

    async fn tick(&self) {
        let Some(callback) = lock(&self.callback).clone() else {
            return;
        };
        {
            let mut counters = lock(&self.counters);
            counters.total += 1;
            counters.last_execution = Some(Utc::now());
        }

        // A panicking body counts as a failed tick
        let outcome = match tokio::spawn(callback()).await {
            Ok(result) => result,
            Err(e) => Err(format!("tick panicked: {}", e).into()),
        };

        let mut counters = lock(&self.counters);
        match outcome {
            Ok(()) => {
                counters.successful += 1;
                counters.consecutive_failures = 0;
            }
            Err(e) => {
                counters.failed += 1;
                counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
                tracing::error!(
                    scheduler = %self.name,
                    consecutive_failures = counters.consecutive_failures,
                    "Scheduler tick failed: {}",
                    e
                );
                counters.last_error = Some(e.to_string());
            }
        }
    }
}

async fn run_loop(inner: Arc<Inner>, token: CancellationToken) {
    loop {
        let delay = inner.next_delay();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        inner.tick().await;
    }
    tracing::debug!(scheduler = %inner.name, "Scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting(scheduler: &IntervalScheduler) -> Arc<AtomicUsize> {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        scheduler.on_tick(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TickError>(())
            }
        });
        ticks
    }

    #[test]
    fn test_new_validates_arguments() {
        assert_eq!(
            IntervalScheduler::new("  ", Duration::from_secs(1)).err(),
            Some(SchedulerError::EmptyName)
        );
        assert_eq!(
            IntervalScheduler::new("poll", Duration::ZERO).err(),
            Some(SchedulerError::ZeroInterval)
        );
    }

    #[tokio::test]
    async fn test_start_without_callback_fails() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(1)).unwrap();
        assert_eq!(
            scheduler.start(),
            Err(SchedulerError::NoCallback("poll".to_string()))
        );
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(1)).unwrap();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().total_executions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_keeps_one_loop() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(1)).unwrap();
        let ticks = counting(&scheduler);

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.stop();
        scheduler.join().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().successful_executions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_back_off() {
        let scheduler = IntervalScheduler::new("flaky", Duration::from_secs(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        scheduler.on_tick(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), TickError>("boom".into())
            }
        });

        scheduler.start().unwrap();
        // Ticks at 1s, then 1+2=3s, then 3+4=7s
        tokio::time::sleep(Duration::from_millis(7500)).await;
        scheduler.stop();
        scheduler.join().await;

        let stats = scheduler.stats();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.failed_executions, 3);
        assert_eq!(stats.successful_executions, 0);
        assert_eq!(stats.consecutive_failures, 3);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_backoff_saturates_on_huge_interval() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(u64::MAX / 2)).unwrap();
        lock(&scheduler.inner.counters).consecutive_failures = 3;
        assert_eq!(scheduler.inner.next_delay(), Duration::MAX);

        lock(&scheduler.inner.counters).consecutive_failures = 0;
        assert_eq!(scheduler.inner.next_delay(), Duration::from_secs(u64::MAX / 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_stop_loop() {
        let scheduler = IntervalScheduler::new("panicky", Duration::from_secs(1)).unwrap();
        let first = Arc::new(AtomicBool::new(true));
        scheduler.on_tick(move || {
            let explode = first.swap(false, Ordering::SeqCst);
            async move {
                if explode {
                    panic!("tick exploded");
                }
                Ok::<(), TickError>(())
            }
        });

        scheduler.start().unwrap();
        // Panic at 1s, backoff to 3s for the next tick
        tokio::time::sleep(Duration::from_millis(3500)).await;
        scheduler.stop();
        scheduler.join().await;

        let stats = scheduler.stats();
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_do_not_overlap() {
        let scheduler = IntervalScheduler::new("slow", Duration::from_millis(100)).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (a, o) = (Arc::clone(&active), Arc::clone(&overlapped));
        scheduler.on_tick(move || {
            let (active, overlapped) = (Arc::clone(&a), Arc::clone(&o));
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(350)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), TickError>(())
            }
        });

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.stop();
        scheduler.join().await;

        assert!(!overlapped.load(Ordering::SeqCst));
        // Each cycle is 100ms wait plus 350ms body
        assert_eq!(scheduler.stats().total_executions, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_applies_to_next_tick() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(10)).unwrap();
        let ticks = counting(&scheduler);
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(10500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // The delay already under way still runs out at 20s
        scheduler.set_interval(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 5);

        assert_eq!(scheduler.set_interval(Duration::ZERO), Err(SchedulerError::ZeroInterval));
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(1)).unwrap();
        let ticks = counting(&scheduler);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_logging_ends_with_scheduler() {
        let scheduler = IntervalScheduler::new("poll", Duration::from_secs(1)).unwrap();
        counting(&scheduler);
        let logger = scheduler.enable_periodic_stats_logging(Duration::from_secs(5));

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        scheduler.stop();

        logger.await.unwrap();
        assert!(scheduler.stats().total_executions >= 11);
    }
}
