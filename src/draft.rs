use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::ContentGenerator;
use crate::catalog::{Catalog, ContentItem};
use crate::config::GeneratorConfig;
use crate::diff::{diff_lines, DiffSummary};
use crate::error::GolemError;
use crate::lease::{draft_key, LeaseManager, LeaseOptions};
use crate::records::{draft_artifact_key, Records};
use crate::store::Table;
use crate::types::{AnalysisStatus, DraftRecord, DraftStatus, ReviewDecision, Usage};

/// A generated rewrite awaiting review.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DraftArtifact {
    pub item_id: String,
    pub content: String,
    pub diff: DiffSummary,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub record: DraftRecord,
    /// The reviewed artifact, removed from the store by the review.
    pub artifact: Option<DraftArtifact>,
}

/// Reject rewrites that are empty, unchanged, or much shorter than the
/// original.
pub fn validate_rewrite(original: &str, rewrite: &str, min_length_ratio: f64) -> Result<(), String> {
    let rewrite = rewrite.trim();
    if rewrite.is_empty() {
        return Err("Generated draft is empty".to_string());
    }
    let original = original.trim();
    if rewrite == original {
        return Err("Generated draft is identical to the original".to_string());
    }
    let original_len = original.chars().count();
    if original_len > 0 {
        let ratio = rewrite.chars().count() as f64 / original_len as f64;
        if ratio < min_length_ratio {
            return Err(format!(
                "Generated draft is too short ({:.0}% of the original, minimum {:.0}%)",
                ratio * 100.0,
                min_length_ratio * 100.0
            ));
        }
    }
    Ok(())
}

/// Single-item rewrite, exclusive per item via the `draft:<id>` lease.
pub struct DraftPipeline<G> {
    records: Records,
    leases: LeaseManager,
    catalog: Arc<dyn Catalog>,
    generator: Arc<G>,
    lease: LeaseOptions,
    settings: GeneratorConfig,
}

impl<G: ContentGenerator> DraftPipeline<G> {
    pub fn new(
        records: Records,
        leases: LeaseManager,
        catalog: Arc<dyn Catalog>,
        generator: Arc<G>,
        lease: LeaseOptions,
        settings: GeneratorConfig,
    ) -> Self {
        Self {
            records,
            leases,
            catalog,
            generator,
            lease,
            settings,
        }
    }

    pub fn artifact(&self, item_id: &str) -> Result<Option<DraftArtifact>, GolemError> {
        Ok(self
            .records
            .get(Table::Artifacts, &draft_artifact_key(item_id))?)
    }

    fn ensure_no_artifact(&self, item_id: &str) -> Result<(), GolemError> {
        if self.artifact(item_id)?.is_some() {
            return Err(GolemError::DraftExists(item_id.to_string()));
        }
        Ok(())
    }

    /// Generate a rewrite for one item.
    ///
    /// Refuses when an unreviewed draft exists. The item ends `completed` or
    /// `error`, and the lease is released on every path.
    pub async fn create_draft(&self, item_id: &str) -> Result<DraftRecord, GolemError> {
        let item = self
            .catalog
            .get(item_id)
            .map_err(GolemError::Catalog)?
            .ok_or_else(|| GolemError::ItemNotFound(item_id.to_string()))?;

        self.ensure_no_artifact(item_id)?;

        let guard = self
            .leases
            .acquire(&draft_key(item_id), &self.lease)
            .await?
            .ok_or_else(|| GolemError::InProgress {
                operation: "Draft creation".to_string(),
                item_id: item_id.to_string(),
            })?;

        // A concurrent creator may have finished while we waited.
        self.ensure_no_artifact(item_id)?;

        // Holding the lease, a `creating` row can only be an orphan.
        let current = self
            .records
            .tracked_item(item_id)?
            .map(|tracked| tracked.draft_status)
            .unwrap_or_default();
        if current != DraftStatus::Creating && !current.is_valid_transition(&DraftStatus::Creating) {
            return Err(GolemError::InvalidTransition(format!(
                "draft for {} is {}, review it before creating another",
                item_id, current
            )));
        }

        // Record first: a failed write leaves the item status untouched.
        let started = Utc::now();
        self.records
            .put_draft(&DraftRecord::started(item_id, started))?;
        self.records
            .set_draft_status(item_id, DraftStatus::Creating)?;

        let result = self.run(&item).await;

        let mut record = DraftRecord::started(item_id, started);
        record.updated_at = Utc::now();
        let outcome = match result {
            Ok((artifact, usage)) => {
                let key = draft_artifact_key(item_id);
                match self.records.put(Table::Artifacts, &key, &artifact, None) {
                    Ok(()) => {
                        record.status = DraftStatus::Completed;
                        record.artifact_ref = Some(key);
                        record.cost_usd = self
                            .settings
                            .cost_usd(usage.prompt_tokens, usage.completion_tokens);
                        record.usage = Some(usage);
                        Ok(())
                    }
                    Err(e) => {
                        record.status = DraftStatus::Error;
                        record.error_message = Some(e.to_string());
                        Err(GolemError::from(e))
                    }
                }
            }
            Err(e) => {
                record.status = DraftStatus::Error;
                record.error_message = Some(e.to_string());
                Err(e)
            }
        };

        let persisted = self
            .records
            .put_draft(&record)
            .and_then(|_| self.records.set_draft_status(item_id, record.status));
        if let Err(e) = &persisted {
            self.abandon(item_id, record.artifact_ref.as_deref(), &e.to_string());
        }

        if let Err(e) = guard.release() {
            warn!(item_id, "Failed to release draft lease: {}", e);
        }

        persisted?;
        outcome?;
        info!(item_id, cost_usd = record.cost_usd, "Draft created");
        Ok(record)
    }

    /// Best-effort cleanup when the outcome of a creation could not be
    /// stored. Moves the item to `error` and drops the orphaned artifact so a
    /// retry is not refused.
    fn abandon(&self, item_id: &str, artifact_ref: Option<&str>, cause: &str) {
        warn!(item_id, "Failed to persist draft outcome: {}", cause);
        if let Some(key) = artifact_ref {
            if let Err(e) = self.records.store().remove(Table::Artifacts, key) {
                warn!(item_id, "Failed to remove draft artifact: {}", e);
            }
        }
        let marked = self.records.update_draft(item_id, |draft| {
            draft.status = DraftStatus::Error;
            draft.artifact_ref = None;
            draft.error_message = Some(cause.to_string());
            draft.updated_at = Utc::now();
            true
        });
        if let Err(e) = marked {
            warn!(item_id, "Failed to mark draft record as error: {}", e);
        }
        if let Err(e) = self.records.set_draft_status(item_id, DraftStatus::Error) {
            warn!(item_id, "Failed to mark draft status as error: {}", e);
        }
    }

    async fn run(&self, item: &ContentItem) -> Result<(DraftArtifact, Usage), GolemError> {
        let tracked = self.records.tracked_item(&item.id)?;
        let findings = self
            .records
            .analysis(&item.id)?
            .filter(|analysis| analysis.status == AnalysisStatus::Completed)
            .map(|analysis| analysis.findings)
            .unwrap_or_default();

        let prompt = crate::prompt::build_draft_prompt(item, tracked.as_ref(), &findings);
        let generation = self
            .generator
            .generate(&prompt, self.settings.timeout())
            .await
            .map_err(GolemError::Generation)?;

        validate_rewrite(&item.body, &generation.text, self.settings.min_length_ratio)
            .map_err(GolemError::Validation)?;

        let content = generation.text.trim().to_string();
        let artifact = DraftArtifact {
            item_id: item.id.clone(),
            diff: diff_lines(&item.body, &content),
            content,
            created_at: Utc::now(),
        };
        Ok((artifact, generation.usage))
    }

    /// Resolve a completed draft. Records the decision, deletes the artifact
    /// and returns the item to `pending`.
    pub async fn review(
        &self,
        item_id: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewOutcome, GolemError> {
        let tracked = self
            .records
            .tracked_item(item_id)?
            .ok_or_else(|| GolemError::ItemNotFound(item_id.to_string()))?;
        if tracked.draft_status != DraftStatus::Completed {
            return Err(GolemError::InvalidTransition(format!(
                "draft for {} is {}, only a completed draft can be reviewed",
                item_id, tracked.draft_status
            )));
        }

        let guard = self
            .leases
            .acquire(&draft_key(item_id), &self.lease)
            .await?
            .ok_or_else(|| GolemError::InProgress {
                operation: "Draft creation".to_string(),
                item_id: item_id.to_string(),
            })?;

        let artifact = self.artifact(item_id)?;
        let now = Utc::now();
        let updated = self.records.update_draft(item_id, |record| {
            record.status = DraftStatus::Pending;
            record.review = Some(decision);
            record.artifact_ref = None;
            record.updated_at = now;
            true
        })?;
        self.records
            .store()
            .remove(Table::Artifacts, &draft_artifact_key(item_id))?;
        self.records
            .set_draft_status(item_id, DraftStatus::Pending)?;

        if let Err(e) = guard.release() {
            warn!(item_id, "Failed to release draft lease: {}", e);
        }

        let record = updated.unwrap_or_else(|| {
            let mut record = DraftRecord::started(item_id, now);
            record.status = DraftStatus::Pending;
            record.review = Some(decision);
            record
        });
        info!(item_id, decision = ?decision, "Draft reviewed");
        Ok(ReviewOutcome { record, artifact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_rewrite_is_rejected() {
        let err = validate_rewrite("abcdefghij", "abc", 0.5).unwrap_err();
        assert!(err.contains("too short"), "{}", err);
    }

    #[test]
    fn whitespace_only_change_counts_as_identical() {
        let err = validate_rewrite("same text\n", "  same text  ", 0.5).unwrap_err();
        assert!(err.contains("identical"), "{}", err);
    }

    #[test]
    fn reasonable_rewrite_passes() {
        assert!(validate_rewrite("old body text", "new body text!", 0.5).is_ok());
    }
}
