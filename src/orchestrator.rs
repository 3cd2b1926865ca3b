use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::GolemConfig;
use crate::error::GolemError;
use crate::metrics::MetricsSource;
use crate::processor::ItemProcessor;
use crate::queue::{NewTask, Task, TaskQueue};
use crate::records::Records;
use crate::types::{next_job_id, BatchError, BatchTask, Job, JobStatus, Progress};

/// Task name of one prioritization batch.
pub const PRIORITIZE_BATCH_TASK: &str = "prioritize_batch";

/// Cancellation group holding every batch task of one job.
pub fn batch_group(job_id: &str) -> String {
    format!("prioritize:{}", job_id)
}

pub fn batch_task_key(job_id: &str, batch_number: u32) -> String {
    format!("prioritize:{}:{:06}", job_id, batch_number)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    pub job_ttl: Duration,
    /// Ceiling on the time since a running job's last progress
    /// (`Job::last_update_at`), not on its age. A long job that keeps
    /// finishing batches is never timed out.
    pub stale_after: Duration,
    pub max_recorded_errors: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&GolemConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &GolemConfig) -> Self {
        Self {
            batch_size: config.batch.batch_size,
            job_ttl: config.batch.job_ttl(),
            stale_after: config.batch.stale_after(),
            max_recorded_errors: config.batch.max_recorded_errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStarted {
    pub job_id: String,
    pub total_items: usize,
    pub total_batches: u32,
}

/// What happened after a batch's counters were recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Enqueued(u32),
    Finalized(JobStatus),
    /// The job left `running` while the batch was in flight.
    Stopped(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Processed {
        batch: u32,
        processed: usize,
        succeeded: usize,
        cache_hits: usize,
        failed: usize,
        next: NextStep,
    },
    /// The job this batch belongs to no longer exists.
    Superseded,
    /// The job is terminal; nothing was processed.
    Stopped(JobStatus),
    /// Redelivery of a batch whose counters were already recorded.
    Duplicate { batch: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: String,
    pub removed_tasks: usize,
}

/// Owns the prioritization job lifecycle: start, per-batch handling,
/// finalization, cancellation, and the staleness sweep.
pub struct BatchOrchestrator<M> {
    records: Records,
    catalog: Arc<dyn Catalog>,
    queue: Arc<dyn TaskQueue>,
    processor: ItemProcessor<M>,
    settings: OrchestratorSettings,
}

impl<M: MetricsSource> BatchOrchestrator<M> {
    pub fn new(
        records: Records,
        catalog: Arc<dyn Catalog>,
        queue: Arc<dyn TaskQueue>,
        processor: ItemProcessor<M>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            records,
            catalog,
            queue,
            processor,
            settings,
        }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Create a job and schedule its first batch. Does not wait for the job.
    pub async fn start(&self) -> Result<JobStarted, GolemError> {
        self.sweep_stale()?;

        if let Some(job) = self.records.current_job()? {
            if job.is_running() {
                return Err(GolemError::JobAlreadyRunning(job.job_id));
            }
        }

        self.processor
            .source()
            .verify()
            .await
            .map_err(GolemError::SourceUnavailable)?;

        let total_items = self.catalog.count().map_err(GolemError::Catalog)?;
        if total_items == 0 {
            return Err(GolemError::NothingToDo);
        }

        let now = Utc::now();
        let batch_size = self.settings.batch_size.max(1);
        let fresh = Job::new(next_job_id(now), total_items, batch_size, now);

        // Check-and-create in one write so two starters cannot both win.
        let mut created = false;
        let stored = self.records.update_job(self.settings.job_ttl, |current| match current {
            Some(job) if job.is_running() => None,
            _ => {
                created = true;
                Some(fresh)
            }
        })?;
        let job = match stored {
            Some(job) if created => job,
            Some(other) => return Err(GolemError::JobAlreadyRunning(other.job_id)),
            None => return Err(GolemError::NoActiveJob),
        };

        let first = BatchTask {
            job_id: job.job_id.clone(),
            batch_number: 1,
            offset: 0,
            batch_size,
        };
        if let Err(e) = self.enqueue_batch(&first) {
            self.fail_job(&job.job_id, &format!("Failed to schedule first batch: {}", e))?;
            return Err(e);
        }

        info!(
            job_id = %job.job_id,
            total_items = job.total_items,
            total_batches = job.total_batches,
            "Prioritization job started"
        );

        Ok(JobStarted {
            job_id: job.job_id,
            total_items: job.total_items,
            total_batches: job.total_batches,
        })
    }

    fn enqueue_batch(&self, task: &BatchTask) -> Result<bool, GolemError> {
        let payload =
            serde_json::to_value(task).map_err(|e| GolemError::Queue(e.to_string()))?;
        self.queue
            .enqueue(NewTask {
                key: batch_task_key(&task.job_id, task.batch_number),
                name: PRIORITIZE_BATCH_TASK.to_string(),
                group: batch_group(&task.job_id),
                payload,
            })
            .map_err(GolemError::Queue)
    }

    /// Process one batch. Safe to re-run for the same `(job_id, batch_number)`.
    ///
    /// Per-item failures are recorded on the job and never abort the batch.
    /// An `Err` means the invocation itself could not proceed and should be
    /// retried by the task runtime.
    pub async fn handle_batch(&self, task: &BatchTask) -> Result<BatchOutcome, GolemError> {
        let Some(job) = self.records.current_job()? else {
            info!(job_id = %task.job_id, batch = task.batch_number, "Job gone, dropping batch");
            return Ok(BatchOutcome::Superseded);
        };
        if job.job_id != task.job_id {
            info!(job_id = %task.job_id, batch = task.batch_number, "Job superseded, dropping batch");
            return Ok(BatchOutcome::Superseded);
        }
        if !job.is_running() {
            debug!(job_id = %job.job_id, status = %job.status, "Job not running, dropping batch");
            return Ok(BatchOutcome::Stopped(job.status));
        }
        if task.batch_number <= job.current_batch {
            return self.redelivered(&job, task).await;
        }

        let items = self
            .catalog
            .page(task.offset, task.batch_size)
            .map_err(GolemError::Catalog)?;

        let mut succeeded = 0;
        let mut cache_hits = 0;
        let mut batch_errors = Vec::new();
        for item in &items {
            let outcome = self.processor.process(item).await;
            if outcome.success {
                succeeded += 1;
            }
            if outcome.cache_hit {
                cache_hits += 1;
            }
            if let Some(message) = outcome.error {
                batch_errors.push(BatchError {
                    batch: task.batch_number,
                    item_id: outcome.item_id,
                    message,
                });
            }
        }
        let processed = items.len();
        let failed = batch_errors.len();

        let max_errors = self.settings.max_recorded_errors;
        let mut applied = false;
        let updated = self.records.update_job(self.settings.job_ttl, |current| {
            let mut job = current?;
            if job.job_id != task.job_id || task.batch_number <= job.current_batch {
                return None;
            }
            job.processed_count = (job.processed_count + processed).min(job.total_items);
            job.current_batch = task.batch_number;
            job.success_count += succeeded;
            job.cache_hit_count += cache_hits;
            let room = max_errors.saturating_sub(job.errors.len());
            job.errors.extend(batch_errors.into_iter().take(room));
            job.last_update_at = Utc::now();
            applied = true;
            Some(job)
        })?;

        let Some(job) = updated else {
            return Ok(BatchOutcome::Superseded);
        };
        if job.job_id != task.job_id {
            return Ok(BatchOutcome::Superseded);
        }
        if !applied {
            debug!(job_id = %job.job_id, batch = task.batch_number, "Batch recorded concurrently");
            return Ok(BatchOutcome::Duplicate {
                batch: task.batch_number,
            });
        }

        info!(
            job_id = %job.job_id,
            batch = task.batch_number,
            total_batches = job.total_batches,
            processed,
            succeeded,
            failed,
            "Batch complete"
        );

        let next = if job.is_running() {
            self.advance(&job, task).await?
        } else {
            NextStep::Stopped(job.status)
        };

        Ok(BatchOutcome::Processed {
            batch: task.batch_number,
            processed,
            succeeded,
            cache_hits,
            failed,
            next,
        })
    }

    /// A batch whose counters are already on the job. Only the latest batch
    /// may repair the chain, in case the first delivery died after recording
    /// progress but before scheduling what comes next.
    async fn redelivered(&self, job: &Job, task: &BatchTask) -> Result<BatchOutcome, GolemError> {
        debug!(job_id = %job.job_id, batch = task.batch_number, "Duplicate batch delivery");
        if job.current_batch == task.batch_number {
            self.advance(job, task).await?;
        }
        Ok(BatchOutcome::Duplicate {
            batch: task.batch_number,
        })
    }

    async fn advance(&self, job: &Job, task: &BatchTask) -> Result<NextStep, GolemError> {
        let next_offset = task.offset + task.batch_size;
        if next_offset < job.total_items {
            let next = BatchTask {
                job_id: job.job_id.clone(),
                batch_number: task.batch_number + 1,
                offset: next_offset,
                batch_size: task.batch_size,
            };
            self.enqueue_batch(&next)?;
            Ok(NextStep::Enqueued(next.batch_number))
        } else {
            Ok(NextStep::Finalized(self.finalize(&job.job_id).await?))
        }
    }

    /// Recompute the global display order in one pass and complete the job.
    ///
    /// A failure here fails the job; items are not re-processed.
    pub async fn finalize(&self, job_id: &str) -> Result<JobStatus, GolemError> {
        match self.records.current_job()? {
            Some(job) if job.job_id == job_id && job.is_running() => {}
            Some(job) if job.job_id == job_id => return Ok(job.status),
            _ => return Err(GolemError::NoActiveJob),
        }

        if let Err(e) = self.assign_display_order() {
            error!(job_id, "Finalize failed: {}", e);
            self.fail_job(job_id, &format!("Finalize failed: {}", e))?;
            return Ok(JobStatus::Failed);
        }

        let now = Utc::now();
        let stored = self.records.update_job(self.settings.job_ttl, |current| {
            let mut job = current?;
            (job.job_id == job_id && job.finish(JobStatus::Complete, now)).then_some(job)
        })?;

        let status = stored.map_or(JobStatus::Complete, |job| job.status);
        info!(job_id, status = %status, "Prioritization job finalized");
        Ok(status)
    }

    /// Rank every tracked item by priority (desc), then id. Returns the
    /// number of rows whose order changed.
    fn assign_display_order(&self) -> Result<usize, GolemError> {
        let mut ranking: Vec<(u32, String)> = self
            .records
            .tracked_items()?
            .into_iter()
            .map(|item| (item.priority_score, item.item_id))
            .collect();
        ranking.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut changed = 0;
        for (idx, (_, item_id)) in ranking.iter().enumerate() {
            let rank = idx as u32 + 1;
            let wrote = self.records.update_item_if(item_id, |item| {
                if item.display_order == Some(rank) {
                    return false;
                }
                item.display_order = Some(rank);
                true
            })?;
            if wrote.is_some_and(|item| item.display_order == Some(rank)) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Stop the running job. Queued batches are removed; a batch already in
    /// flight finishes its slice and then stops.
    pub fn cancel(&self) -> Result<CancelOutcome, GolemError> {
        let job = match self.records.current_job()? {
            Some(job) if job.is_running() => job,
            _ => return Err(GolemError::NoActiveJob),
        };

        let now = Utc::now();
        let mut applied = false;
        self.records.update_job(self.settings.job_ttl, |current| {
            let mut stored = current?;
            if stored.job_id != job.job_id || !stored.finish(JobStatus::Cancelled, now) {
                return None;
            }
            applied = true;
            Some(stored)
        })?;
        if !applied {
            return Err(GolemError::NoActiveJob);
        }

        let removed_tasks = self
            .queue
            .cancel_group(&batch_group(&job.job_id))
            .map_err(GolemError::Queue)?;
        info!(job_id = %job.job_id, removed_tasks, "Prioritization job cancelled");

        Ok(CancelOutcome {
            job_id: job.job_id,
            removed_tasks,
        })
    }

    /// Snapshot of the current job. Never fails.
    pub fn progress(&self) -> Progress {
        if let Err(e) = self.sweep_stale() {
            warn!("Staleness sweep failed: {}", e);
        }
        match self.records.current_job() {
            Ok(Some(job)) => Progress::Active(job),
            Ok(None) => Progress::Idle,
            Err(e) => Progress::Unavailable(e.to_string()),
        }
    }

    /// Time out a running job that has made no progress within
    /// `stale_after`, and drop its queued batches.
    pub fn sweep_stale(&self) -> Result<Option<Job>, GolemError> {
        let Some(job) = self.records.current_job()? else {
            return Ok(None);
        };
        let now = Utc::now();
        let idle = now
            .signed_duration_since(job.last_update_at)
            .to_std()
            .unwrap_or_default();
        if !job.is_running() || idle <= self.settings.stale_after {
            return Ok(None);
        }

        let reason = format!(
            "No progress for {} minutes",
            self.settings.stale_after.as_secs() / 60
        );
        let stored = self.records.update_job(self.settings.job_ttl, |current| {
            let mut stored = current?;
            if stored.job_id != job.job_id || stored.last_update_at != job.last_update_at {
                return None;
            }
            stored.finish(JobStatus::Timeout, now).then(|| {
                stored.failure_reason = Some(reason);
                stored
            })
        })?;

        match stored {
            Some(timed_out) if timed_out.status == JobStatus::Timeout => {
                let removed = self
                    .queue
                    .cancel_group(&batch_group(&timed_out.job_id))
                    .map_err(GolemError::Queue)?;
                warn!(job_id = %timed_out.job_id, removed_tasks = removed, "Stale job timed out");
                Ok(Some(timed_out))
            }
            _ => Ok(None),
        }
    }

    /// Mark a running job failed. Returns false if it had already left
    /// `running` (or is not the current job).
    pub fn fail_job(&self, job_id: &str, reason: &str) -> Result<bool, GolemError> {
        let now = Utc::now();
        let mut applied = false;
        self.records.update_job(self.settings.job_ttl, |current| {
            let mut job = current?;
            if job.job_id != job_id || !job.finish(JobStatus::Failed, now) {
                return None;
            }
            job.failure_reason = Some(reason.to_string());
            applied = true;
            Some(job)
        })?;
        if applied {
            error!(job_id, "Prioritization job failed: {}", reason);
            self.queue
                .cancel_group(&batch_group(job_id))
                .map_err(GolemError::Queue)?;
        }
        Ok(applied)
    }

    /// Dispatch one dequeued task.
    pub async fn handle_task(&self, task: &Task) -> Result<(), GolemError> {
        match task.name.as_str() {
            PRIORITIZE_BATCH_TASK => {
                let batch: BatchTask = serde_json::from_value(task.payload.clone())
                    .map_err(|e| GolemError::Queue(format!("Malformed batch payload: {}", e)))?;
                self.handle_batch(&batch).await.map(|_| ())
            }
            other => Err(GolemError::Queue(format!("Unknown task '{}'", other))),
        }
    }

    /// Called once a task has failed its final attempt.
    pub fn task_exhausted(&self, task: &Task, error: &str) -> Result<(), GolemError> {
        if task.name != PRIORITIZE_BATCH_TASK {
            return Ok(());
        }
        if let Ok(batch) = serde_json::from_value::<BatchTask>(task.payload.clone()) {
            self.fail_job(
                &batch.job_id,
                &format!("Batch {} failed after {} attempts: {}", batch.batch_number, task.attempts, error),
            )?;
        }
        Ok(())
    }
}
