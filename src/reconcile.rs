use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::GolemError;
use crate::lease::{analysis_key, draft_key, LeaseManager};
use crate::records::Records;
use crate::types::{AnalysisStatus, DraftStatus};

const ORPHANED_MESSAGE: &str = "Interrupted: the worker stopped before finishing";

/// Which in-progress state a reset applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Analysis,
    Draft,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Analysis => "analysis",
            Operation::Draft => "draft",
        }
    }

    fn lease_key(&self, item_id: &str) -> String {
        match self {
            Operation::Analysis => analysis_key(item_id),
            Operation::Draft => draft_key(item_id),
        }
    }
}

/// Where an orphaned in-progress status was moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    /// Orphaned recently; the caller may offer a retry.
    Interrupted,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reset {
    pub item_id: String,
    pub operation: Operation,
    pub target: ResetTarget,
    /// True for the audit record, false for the tracked item row.
    pub audit_row: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// In-progress rows inspected.
    pub inspected: usize,
    /// In-progress rows whose lease is still live.
    pub still_running: usize,
    pub resets: Vec<Reset>,
}

/// Detects in-progress statuses whose worker is gone (no live lease) and
/// moves them to a resumable status.
#[derive(Debug, Clone)]
pub struct StatusReconciler {
    records: Records,
    leases: LeaseManager,
    grace: Duration,
}

impl StatusReconciler {
    pub fn new(records: Records, leases: LeaseManager, grace: Duration) -> Self {
        Self {
            records,
            leases,
            grace,
        }
    }

    fn target_for(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ResetTarget {
        let recent = since.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .map_or(true, |age| age <= self.grace)
        });
        if recent {
            ResetTarget::Interrupted
        } else {
            ResetTarget::Pending
        }
    }

    /// True when the caller should leave the row alone.
    fn lease_live(
        &self,
        operation: Operation,
        item_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<bool, GolemError> {
        report.inspected += 1;
        let live = self.leases.is_live(&operation.lease_key(item_id))?;
        if live {
            debug!(item_id, operation = operation.as_str(), "Lease live, leaving in progress");
            report.still_running += 1;
        }
        Ok(live)
    }

    /// One pass over tracked items and audit records.
    ///
    /// Every reset is compare-and-swap guarded on the observed timestamp, so
    /// a worker that re-entered the state since the scan is left alone.
    pub fn reconcile(&self) -> Result<ReconcileReport, GolemError> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for item in self.records.tracked_items()? {
            if item.analysis_status.is_in_progress()
                && !self.lease_live(Operation::Analysis, &item.item_id, &mut report)?
            {
                let observed = item.analysis_updated_at;
                let target = self.target_for(observed, now);
                let written = self.records.update_item_if(&item.item_id, |row| {
                    if !row.analysis_status.is_in_progress() || row.analysis_updated_at != observed {
                        return false;
                    }
                    row.analysis_status = match target {
                        ResetTarget::Interrupted => AnalysisStatus::Interrupted,
                        ResetTarget::Pending => AnalysisStatus::Pending,
                    };
                    row.analysis_updated_at = Some(now);
                    true
                })?;
                if written.is_some_and(|row| row.analysis_updated_at == Some(now)) {
                    report.resets.push(Reset {
                        item_id: item.item_id.clone(),
                        operation: Operation::Analysis,
                        target,
                        audit_row: false,
                    });
                }
            }

            if item.draft_status.is_in_progress()
                && !self.lease_live(Operation::Draft, &item.item_id, &mut report)?
            {
                let observed = item.draft_updated_at;
                let target = self.target_for(observed, now);
                let written = self.records.update_item_if(&item.item_id, |row| {
                    if !row.draft_status.is_in_progress() || row.draft_updated_at != observed {
                        return false;
                    }
                    row.draft_status = match target {
                        ResetTarget::Interrupted => DraftStatus::Interrupted,
                        ResetTarget::Pending => DraftStatus::Pending,
                    };
                    row.draft_updated_at = Some(now);
                    true
                })?;
                if written.is_some_and(|row| row.draft_updated_at == Some(now)) {
                    report.resets.push(Reset {
                        item_id: item.item_id.clone(),
                        operation: Operation::Draft,
                        target,
                        audit_row: false,
                    });
                }
            }
        }

        for record in self.records.analyses()? {
            if !record.status.is_in_progress()
                || self.lease_live(Operation::Analysis, &record.item_id, &mut report)?
            {
                continue;
            }
            let observed = record.updated_at;
            let target = self.target_for(Some(observed), now);
            let written = self.records.update_analysis(&record.item_id, |row| {
                if !row.status.is_in_progress() || row.updated_at != observed {
                    return false;
                }
                row.status = match target {
                    ResetTarget::Interrupted => AnalysisStatus::Interrupted,
                    ResetTarget::Pending => AnalysisStatus::Pending,
                };
                row.error_message = Some(ORPHANED_MESSAGE.to_string());
                row.updated_at = now;
                true
            })?;
            if written.is_some_and(|row| row.updated_at == now) {
                report.resets.push(Reset {
                    item_id: record.item_id.clone(),
                    operation: Operation::Analysis,
                    target,
                    audit_row: true,
                });
            }
        }

        for record in self.records.drafts()? {
            if !record.status.is_in_progress()
                || self.lease_live(Operation::Draft, &record.item_id, &mut report)?
            {
                continue;
            }
            let observed = record.updated_at;
            let target = self.target_for(Some(observed), now);
            let written = self.records.update_draft(&record.item_id, |row| {
                if !row.status.is_in_progress() || row.updated_at != observed {
                    return false;
                }
                row.status = match target {
                    ResetTarget::Interrupted => DraftStatus::Interrupted,
                    ResetTarget::Pending => DraftStatus::Pending,
                };
                row.error_message = Some(ORPHANED_MESSAGE.to_string());
                row.updated_at = now;
                true
            })?;
            if written.is_some_and(|row| row.updated_at == now) {
                report.resets.push(Reset {
                    item_id: record.item_id.clone(),
                    operation: Operation::Draft,
                    target,
                    audit_row: true,
                });
            }
        }

        if !report.resets.is_empty() {
            info!(
                resets = report.resets.len(),
                still_running = report.still_running,
                "Reconciled orphaned in-progress statuses"
            );
        }
        Ok(report)
    }
}
