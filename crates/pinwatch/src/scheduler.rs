//! Scheduler: interval-driven recurring task runner.
//!
//! Lifecycle is `Idle -> Running -> Stopped`; `Stopped` is terminal. The first tick fires
//! immediately on [Scheduler::start], then once per period. Each tick runs as its own tokio
//! task, so a slow tick never blocks the timer or cancellation:
//!
//! - if a tick is still in flight when the next one is due, the new one is skipped (logged
//!   at debug and counted, never surfaced as an error);
//! - a tick that fails or panics is logged and counted; the loop keeps going;
//! - [Scheduler::stop] cancels the timer and waits for an in-flight tick to finish, so once
//!   it returns the task produces no further side effects.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Unit of recurring work. An error fails only the current tick.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [Task].
pub struct FnTask<F>(pub F);

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler {0} is already running")]
    AlreadyRunning(String),
    #[error("scheduler {0} is stopped; create a new instance")]
    Stopped(String),
    #[error("scheduler {0}: interval must be greater than zero")]
    ZeroInterval(String),
}

/// Tick counters, for logs and tests.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks_started: AtomicU64,
    ticks_completed: AtomicU64,
    ticks_failed: AtomicU64,
    ticks_skipped: AtomicU64,
}

impl SchedulerStats {
    pub fn ticks_started(&self) -> u64 {
        self.ticks_started.load(Ordering::Relaxed)
    }

    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::Relaxed)
    }

    pub fn ticks_failed(&self) -> u64 {
        self.ticks_failed.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }
}

enum Inner {
    Idle,
    Running {
        cancel: CancellationToken,
        driver: JoinHandle<()>,
    },
    Stopped,
}

pub struct Scheduler {
    name: String,
    inner: Mutex<Inner>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::Idle),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    pub async fn state(&self) -> SchedulerState {
        match &*self.inner.lock().await {
            Inner::Idle => SchedulerState::Idle,
            Inner::Running { .. } => SchedulerState::Running,
            Inner::Stopped => SchedulerState::Stopped,
        }
    }

    /// Begin invoking `task` every `period`, starting now.
    pub async fn start(
        &self,
        task: Arc<dyn Task>,
        period: Duration,
    ) -> Result<(), SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroInterval(self.name.clone()));
        }
        let mut inner = self.inner.lock().await;
        match &*inner {
            Inner::Idle => {}
            Inner::Running { .. } => {
                return Err(SchedulerError::AlreadyRunning(self.name.clone()));
            }
            Inner::Stopped => return Err(SchedulerError::Stopped(self.name.clone())),
        }
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            self.name.clone(),
            task,
            period,
            cancel.clone(),
            Arc::clone(&self.stats),
        ));
        tracing::info!(
            scheduler = %self.name,
            period_ms = period.as_millis() as u64,
            "scheduler started"
        );
        *inner = Inner::Running { cancel, driver };
        Ok(())
    }

    /// Stop ticking. Safe to call at any time and more than once.
    ///
    /// Waits for an in-flight tick to complete; no tick starts after this returns.
    pub async fn stop(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut *inner, Inner::Stopped)
        };
        if let Inner::Running { cancel, driver } = previous {
            cancel.cancel();
            if let Err(e) = driver.await {
                tracing::warn!(
                    scheduler = %self.name,
                    reason = %e,
                    "scheduler driver ended abnormally"
                );
            }
            tracing::info!(scheduler = %self.name, "scheduler stopped");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Inner::Running { cancel, .. } = self.inner.get_mut() {
            cancel.cancel();
        }
    }
}

async fn drive(
    name: String,
    task: Arc<dyn Task>,
    period: Duration,
    cancel: CancellationToken,
    stats: Arc<SchedulerStats>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(handle) = in_flight.take() {
            if !handle.is_finished() {
                stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scheduler = %name, "previous tick still running, skipping");
                in_flight = Some(handle);
                continue;
            }
            reap(&name, handle, &stats).await;
        }
        stats.ticks_started.fetch_add(1, Ordering::Relaxed);
        in_flight = Some(tokio::spawn(run_tick(
            name.clone(),
            Arc::clone(&task),
            Arc::clone(&stats),
        )));
    }

    if let Some(handle) = in_flight.take() {
        reap(&name, handle, &stats).await;
    }
}

async fn run_tick(name: String, task: Arc<dyn Task>, stats: Arc<SchedulerStats>) {
    match task.run().await {
        Ok(()) => {
            stats.ticks_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.ticks_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(scheduler = %name, reason = %e, "tick failed");
        }
    }
}

/// Join a finished (or finishing) tick; a panic counts as a failed tick.
async fn reap(name: &str, handle: JoinHandle<()>, stats: &SchedulerStats) {
    if let Err(e) = handle.await {
        stats.ticks_failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(scheduler = %name, reason = %e, "tick panicked");
    }
}
