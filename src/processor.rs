use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::catalog::{Catalog, ContentItem};
use crate::config::GolemConfig;
use crate::metrics::{cache_key, compute_windows, DateWindow, MetricsSource};
use crate::records::Records;
use crate::score::{content_age_score, score_item, ScoreBreakdown};
use crate::types::Metrics;

/// Window and cache policy for metric fetches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorSettings {
    pub window_days: u32,
    pub lag_days: u32,
    pub success_ttl: Duration,
    pub empty_ttl: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config(&GolemConfig::default())
    }
}

impl ProcessorSettings {
    pub fn from_config(config: &GolemConfig) -> Self {
        Self {
            window_days: config.metrics.window_days,
            lag_days: config.metrics.data_lag_days,
            success_ttl: config.cache.success_ttl(),
            empty_ttl: config.cache.empty_ttl(),
        }
    }
}

/// Result of scoring one item. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub item_id: String,
    pub success: bool,
    /// Both windows were served from the cache.
    pub cache_hit: bool,
    pub error: Option<String>,
    pub score: Option<ScoreBreakdown>,
}

impl ProcessOutcome {
    fn failed(item_id: &str, error: String) -> Self {
        Self {
            item_id: item_id.to_string(),
            success: false,
            cache_hit: false,
            error: Some(error),
            score: None,
        }
    }
}

/// Fetches metrics for one item (through the cache), scores it, and
/// persists the scores onto its tracked row.
pub struct ItemProcessor<M> {
    records: Records,
    source: Arc<M>,
    settings: ProcessorSettings,
}

impl<M: MetricsSource> ItemProcessor<M> {
    pub fn new(records: Records, source: Arc<M>, settings: ProcessorSettings) -> Self {
        Self {
            records,
            source,
            settings,
        }
    }

    pub fn source(&self) -> &Arc<M> {
        &self.source
    }

    /// Resolve `item_id` in the catalog, then [`process`](Self::process) it.
    pub async fn process_id(&self, catalog: &dyn Catalog, item_id: &str) -> ProcessOutcome {
        match catalog.get(item_id) {
            Ok(Some(item)) => self.process(&item).await,
            Ok(None) => ProcessOutcome::failed(item_id, format!("Item not found: {}", item_id)),
            Err(e) => ProcessOutcome::failed(item_id, e),
        }
    }

    /// Score one item. On failure a fallback row (age score only, metrics
    /// zeroed) is written so the item never stays unscored.
    pub async fn process(&self, item: &ContentItem) -> ProcessOutcome {
        let now = Utc::now();
        match self.score_and_store(item, now).await {
            Ok((score, cache_hit)) => {
                debug!(item_id = %item.id, priority = score.priority, cache_hit, "Item scored");
                ProcessOutcome {
                    item_id: item.id.clone(),
                    success: true,
                    cache_hit,
                    error: None,
                    score: Some(score),
                }
            }
            Err(message) => {
                warn!(item_id = %item.id, "Scoring failed: {}", message);
                self.store_fallback(item, now, &message);
                ProcessOutcome::failed(&item.id, message)
            }
        }
    }

    async fn score_and_store(
        &self,
        item: &ContentItem,
        now: DateTime<Utc>,
    ) -> Result<(ScoreBreakdown, bool), String> {
        let (current_window, previous_window) = compute_windows(
            now.date_naive(),
            self.settings.window_days,
            self.settings.lag_days,
        );

        let (current, current_hit) = self.cached_fetch(&item.url, &current_window).await?;
        let (previous, previous_hit) = self.cached_fetch(&item.url, &previous_window).await?;

        let score = score_item(&current, &previous, item.age_days(now));

        self.records
            .update_item(&item.id, |row| {
                row.current = current;
                row.previous = previous;
                row.content_age_score = score.content_age;
                row.traffic_decline_score = score.traffic_decline;
                row.traffic_potential_score = score.traffic_potential;
                row.priority_score = score.priority;
                row.scored_at = Some(now);
                row.score_error = None;
            })
            .map_err(|e| e.to_string())?;

        Ok((score, current_hit && previous_hit))
    }

    /// Returns (metrics, served_from_cache).
    async fn cached_fetch(&self, key: &str, window: &DateWindow) -> Result<(Metrics, bool), String> {
        let cache_key = cache_key(key, window);
        if let Some(metrics) = self
            .records
            .cached_metrics(&cache_key)
            .map_err(|e| e.to_string())?
        {
            return Ok((metrics, true));
        }

        let metrics = self.source.fetch_metrics(key, window).await?;
        let ttl = if metrics.is_empty() {
            self.settings.empty_ttl
        } else {
            self.settings.success_ttl
        };
        self.records
            .cache_metrics(&cache_key, &metrics, ttl)
            .map_err(|e| e.to_string())?;
        Ok((metrics, false))
    }

    fn store_fallback(&self, item: &ContentItem, now: DateTime<Utc>, message: &str) {
        let age = content_age_score(item.age_days(now));
        let result = self.records.update_item(&item.id, |row| {
            row.current = Metrics::default();
            row.previous = Metrics::default();
            row.content_age_score = age;
            row.traffic_decline_score = 0;
            row.traffic_potential_score = 0;
            row.priority_score = age;
            row.scored_at = Some(now);
            row.score_error = Some(message.to_string());
        });
        if let Err(e) = result {
            warn!(item_id = %item.id, "Failed to store fallback score: {}", e);
        }
    }
}
