use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::agent::ContentGenerator;
use crate::catalog::{Catalog, ContentItem};
use crate::config::GeneratorConfig;
use crate::error::GolemError;
use crate::lease::{analysis_key, LeaseManager, LeaseOptions};
use crate::metrics::MetricsSource;
use crate::processor::ItemProcessor;
use crate::prompt;
use crate::records::Records;
use crate::types::{AnalysisRecord, AnalysisStatus, Finding, Usage};

#[derive(Deserialize)]
struct FindingsPayload {
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Extract the findings list from generator output. Surrounding prose and
/// markdown code fences are tolerated.
pub fn parse_findings(text: &str) -> Result<Vec<Finding>, String> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err("No JSON object in analysis output".to_string()),
    };
    serde_json::from_str::<FindingsPayload>(json)
        .map(|payload| payload.findings)
        .map_err(|e| format!("Malformed analysis output: {}", e))
}

/// Single-item analysis, exclusive per item via the `analyze:<id>` lease.
pub struct AnalysisPipeline<G, M> {
    records: Records,
    leases: LeaseManager,
    catalog: Arc<dyn Catalog>,
    processor: ItemProcessor<M>,
    generator: Arc<G>,
    lease: LeaseOptions,
    settings: GeneratorConfig,
}

impl<G: ContentGenerator, M: MetricsSource> AnalysisPipeline<G, M> {
    pub fn new(
        records: Records,
        leases: LeaseManager,
        catalog: Arc<dyn Catalog>,
        processor: ItemProcessor<M>,
        generator: Arc<G>,
        lease: LeaseOptions,
        settings: GeneratorConfig,
    ) -> Self {
        Self {
            records,
            leases,
            catalog,
            processor,
            generator,
            lease,
            settings,
        }
    }

    /// Analyze one item. The item always ends `completed` or `error`; the
    /// lease is released on every path.
    pub async fn analyze(&self, item_id: &str) -> Result<AnalysisRecord, GolemError> {
        let item = self
            .catalog
            .get(item_id)
            .map_err(GolemError::Catalog)?
            .ok_or_else(|| GolemError::ItemNotFound(item_id.to_string()))?;

        let guard = self
            .leases
            .acquire(&analysis_key(item_id), &self.lease)
            .await?
            .ok_or_else(|| GolemError::InProgress {
                operation: "Analysis".to_string(),
                item_id: item_id.to_string(),
            })?;

        // Record first: a failed write leaves the item status untouched.
        let started = Utc::now();
        self.records
            .put_analysis(&AnalysisRecord::started(item_id, started))?;
        self.records
            .set_analysis_status(item_id, AnalysisStatus::Analyzing)?;

        let result = self.run(&item).await;

        let mut record = AnalysisRecord::started(item_id, started);
        record.updated_at = Utc::now();
        let outcome = match result {
            Ok((findings, usage)) => {
                record.status = AnalysisStatus::Completed;
                record.issue_count = findings.len();
                record.findings = findings;
                record.cost_usd = self
                    .settings
                    .cost_usd(usage.prompt_tokens, usage.completion_tokens);
                record.usage = Some(usage);
                Ok(())
            }
            Err(e) => {
                record.status = AnalysisStatus::Error;
                record.error_message = Some(e.to_string());
                Err(e)
            }
        };

        let persisted = self
            .records
            .put_analysis(&record)
            .and_then(|_| self.records.set_analysis_status(item_id, record.status));
        if let Err(e) = &persisted {
            self.abandon(item_id, &e.to_string());
        }

        if let Err(e) = guard.release() {
            warn!(item_id, "Failed to release analysis lease: {}", e);
        }

        persisted?;
        outcome?;
        info!(item_id, issues = record.issue_count, cost_usd = record.cost_usd, "Analysis complete");
        Ok(record)
    }

    /// Best-effort move to `error` when the outcome could not be stored.
    fn abandon(&self, item_id: &str, cause: &str) {
        warn!(item_id, "Failed to persist analysis outcome: {}", cause);
        let marked = self.records.update_analysis(item_id, |analysis| {
            analysis.status = AnalysisStatus::Error;
            analysis.error_message = Some(cause.to_string());
            analysis.updated_at = Utc::now();
            true
        });
        if let Err(e) = marked {
            warn!(item_id, "Failed to mark analysis record as error: {}", e);
        }
        if let Err(e) = self.records.set_analysis_status(item_id, AnalysisStatus::Error) {
            warn!(item_id, "Failed to mark analysis status as error: {}", e);
        }
    }

    async fn run(&self, item: &ContentItem) -> Result<(Vec<Finding>, Usage), GolemError> {
        let refreshed = self.processor.process(item).await;
        if let Some(e) = &refreshed.error {
            warn!(item_id = %item.id, "Metrics refresh failed, analyzing with stored data: {}", e);
        }

        let tracked = self.records.tracked_item(&item.id)?;
        let prompt = prompt::build_analysis_prompt(item, tracked.as_ref());
        let generation = self
            .generator
            .generate(&prompt, self.settings.timeout())
            .await
            .map_err(GolemError::Generation)?;
        let findings = parse_findings(&generation.text).map_err(GolemError::Analysis)?;
        Ok((findings, generation.usage))
    }
}
