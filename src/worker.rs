use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::is_shutdown_requested;
use crate::config::GolemConfig;
use crate::error::GolemError;
use crate::metrics::MetricsSource;
use crate::orchestrator::BatchOrchestrator;
use crate::queue::TaskQueue;
use crate::reconcile::StatusReconciler;

/// Cap on the retry delay exponent.
const MAX_BACKOFF_DOUBLINGS: u32 = 10;

// --- Public types ---

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&GolemConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &GolemConfig) -> Self {
        Self {
            visibility_timeout: config.batch.visibility_timeout(),
            max_attempts: config.batch.max_task_attempts,
            retry_base: config.batch.retry_base(),
            poll_interval: config.batch.poll_interval(),
        }
    }

    /// `retry_base * 2^(attempt - 1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        self.retry_base.saturating_mul(1 << doublings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Return once the queue is empty.
    UntilIdle,
    /// Keep polling until cancelled.
    Forever,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Idle,
    ShutdownRequested,
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReport {
    Completed { key: String },
    Retried { key: String, attempt: u32, delay: Duration, error: String },
    Exhausted { key: String, attempts: u32, error: String },
}

/// Result of a worker run, returned to the caller for summary display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub tasks_completed: u32,
    pub tasks_retried: u32,
    pub tasks_exhausted: u32,
    pub drains: u32,
    pub halt_reason: HaltReason,
}

/// Pulls tasks from the queue and hands them to the orchestrator, with
/// retry and exponential backoff. Runs the drain hooks (staleness sweep and
/// reconciler) whenever the queue runs dry.
pub struct Worker<M> {
    orchestrator: Arc<BatchOrchestrator<M>>,
    queue: Arc<dyn TaskQueue>,
    reconciler: Option<StatusReconciler>,
    settings: WorkerSettings,
}

impl<M: MetricsSource> Worker<M> {
    pub fn new(
        orchestrator: Arc<BatchOrchestrator<M>>,
        queue: Arc<dyn TaskQueue>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            reconciler: None,
            settings,
        }
    }

    pub fn with_reconciler(mut self, reconciler: StatusReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Claim and handle at most one task. `Ok(None)` when nothing is available.
    pub async fn run_once(&self) -> Result<Option<TaskReport>, GolemError> {
        let Some(task) = self
            .queue
            .dequeue(self.settings.visibility_timeout)
            .map_err(GolemError::Queue)?
        else {
            return Ok(None);
        };

        debug!(key = %task.key, attempt = task.attempts, "Task claimed");

        let error = match self.orchestrator.handle_task(&task).await {
            Ok(()) => {
                if !self.queue.ack(&task).map_err(GolemError::Queue)? {
                    warn!(key = %task.key, "Task claim lapsed before ack");
                }
                return Ok(Some(TaskReport::Completed { key: task.key }));
            }
            Err(e) => e.to_string(),
        };

        if task.attempts >= self.settings.max_attempts {
            warn!(key = %task.key, attempts = task.attempts, "Task exhausted retries: {}", error);
            self.queue.ack(&task).map_err(GolemError::Queue)?;
            self.orchestrator.task_exhausted(&task, &error)?;
            return Ok(Some(TaskReport::Exhausted {
                key: task.key,
                attempts: task.attempts,
                error,
            }));
        }

        let delay = self.settings.retry_delay(task.attempts);
        warn!(
            key = %task.key,
            attempt = task.attempts,
            delay_ms = delay.as_millis() as u64,
            "Task failed, retrying: {}",
            error
        );
        self.queue
            .retry(&task, delay, &error)
            .map_err(GolemError::Queue)?;
        Ok(Some(TaskReport::Retried {
            key: task.key,
            attempt: task.attempts,
            delay,
            error,
        }))
    }

    /// Queue-drain hooks. Failures are logged, never raised.
    pub fn on_drain(&self) {
        if let Err(e) = self.orchestrator.sweep_stale() {
            warn!("Staleness sweep failed: {}", e);
        }
        if let Some(reconciler) = &self.reconciler {
            if let Err(e) = reconciler.reconcile() {
                warn!("Status reconciliation failed: {}", e);
            }
        }
    }

    /// Run the worker loop.
    ///
    /// The loop:
    /// 1. Stop if cancelled or a shutdown signal arrived
    /// 2. Claim and handle one task
    /// 3. When nothing is claimable, run the drain hooks once per dry spell
    /// 4. In `UntilIdle` mode return once no task is queued at all,
    ///    otherwise sleep `poll_interval` and try again
    pub async fn run(&self, cancel: CancellationToken, mode: RunMode) -> Result<WorkerSummary, GolemError> {
        let mut summary = WorkerSummary {
            tasks_completed: 0,
            tasks_retried: 0,
            tasks_exhausted: 0,
            drains: 0,
            halt_reason: HaltReason::Idle,
        };
        let mut drained = false;

        info!(mode = ?mode, "Worker started");

        loop {
            if cancel.is_cancelled() || is_shutdown_requested() {
                summary.halt_reason = HaltReason::ShutdownRequested;
                break;
            }

            match self.run_once().await? {
                Some(report) => {
                    drained = false;
                    match report {
                        TaskReport::Completed { .. } => summary.tasks_completed += 1,
                        TaskReport::Retried { .. } => summary.tasks_retried += 1,
                        TaskReport::Exhausted { .. } => summary.tasks_exhausted += 1,
                    }
                    continue;
                }
                None => {
                    if !drained {
                        self.on_drain();
                        summary.drains += 1;
                        drained = true;
                    }
                }
            }

            if mode == RunMode::UntilIdle
                && self.queue.pending(None).map_err(GolemError::Queue)? == 0
            {
                summary.halt_reason = HaltReason::Idle;
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = cancel.cancelled() => {
                    summary.halt_reason = HaltReason::ShutdownRequested;
                    break;
                }
            }
        }

        info!(
            completed = summary.tasks_completed,
            retried = summary.tasks_retried,
            exhausted = summary.tasks_exhausted,
            halt = ?summary.halt_reason,
            "Worker stopped"
        );
        Ok(summary)
    }
}
