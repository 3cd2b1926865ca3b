use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{Store, Table};
use crate::types::{
    AnalysisRecord, AnalysisStatus, DraftRecord, DraftStatus, Job, Metrics, TrackedItem,
};

/// Key of the single job slot. At most one job record exists at a time.
pub const CURRENT_JOB_KEY: &str = "current";

/// Typed access to the records kept in a [`Store`].
///
/// Writes to a row go through read-modify-write closures so an operation only
/// touches the fields it owns.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Records {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Records").finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

impl Records {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // --- Generic helpers ---

    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>, StoreError> {
        self.store
            .get(table, key)?
            .map(|v| decode(key, v))
            .transpose()
    }

    pub fn put<T: Serialize>(
        &self,
        table: Table,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store.put(table, key, encode(key, value)?, ttl)
    }

    /// Typed atomic read-modify-write. `f` returning `None` skips the write.
    pub fn update<T, F>(
        &self,
        table: Table,
        key: &str,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let mut f = Some(f);
        let mut failure: Option<StoreError> = None;
        let stored = self.store.update(table, key, ttl, &mut |current| {
            let f = f.take()?;
            let current = match current.map(|v| decode::<T>(key, v.clone())).transpose() {
                Ok(current) => current,
                Err(e) => {
                    failure = Some(e);
                    return None;
                }
            };
            match f(current).map(|next| encode(key, &next)).transpose() {
                Ok(next) => next,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        stored.map(|v| decode(key, v)).transpose()
    }

    pub fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.store
            .scan(table, prefix)?
            .into_iter()
            .map(|(k, v)| decode(&k, v))
            .collect()
    }

    // --- Jobs ---

    pub fn current_job(&self) -> Result<Option<Job>, StoreError> {
        self.get(Table::Jobs, CURRENT_JOB_KEY)
    }

    /// Atomically rewrite the job slot, refreshing its TTL on every write.
    pub fn update_job<F>(&self, ttl: Duration, f: F) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(Option<Job>) -> Option<Job>,
    {
        self.update(Table::Jobs, CURRENT_JOB_KEY, Some(ttl), f)
    }

    // --- Tracked items ---

    pub fn tracked_item(&self, item_id: &str) -> Result<Option<TrackedItem>, StoreError> {
        self.get(Table::Items, item_id)
    }

    pub fn tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        self.scan(Table::Items, "")
    }

    /// Mutate one tracked item in place, creating it lazily. `f` returns
    /// false to abandon the write.
    pub fn update_item_if<F>(&self, item_id: &str, f: F) -> Result<Option<TrackedItem>, StoreError>
    where
        F: FnOnce(&mut TrackedItem) -> bool,
    {
        self.update(Table::Items, item_id, None, |current: Option<TrackedItem>| {
            let mut item = current.unwrap_or_else(|| TrackedItem::new(item_id));
            f(&mut item).then_some(item)
        })
    }

    pub fn update_item<F>(&self, item_id: &str, f: F) -> Result<TrackedItem, StoreError>
    where
        F: FnOnce(&mut TrackedItem),
    {
        let updated = self.update_item_if(item_id, |item| {
            f(item);
            true
        })?;
        Ok(updated.unwrap_or_else(|| TrackedItem::new(item_id)))
    }

    pub fn set_analysis_status(
        &self,
        item_id: &str,
        status: AnalysisStatus,
    ) -> Result<TrackedItem, StoreError> {
        self.update_item(item_id, |item| {
            item.analysis_status = status;
            item.analysis_updated_at = Some(Utc::now());
        })
    }

    pub fn set_draft_status(&self, item_id: &str, status: DraftStatus) -> Result<TrackedItem, StoreError> {
        self.update_item(item_id, |item| {
            item.draft_status = status;
            item.draft_updated_at = Some(Utc::now());
        })
    }

    /// Item-removal event: drop every record kept for the item.
    pub fn remove_item(&self, item_id: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(Table::Items, item_id)?;
        self.store.remove(Table::Analyses, item_id)?;
        self.store.remove(Table::Drafts, item_id)?;
        self.store.remove(Table::Artifacts, &draft_artifact_key(item_id))?;
        Ok(removed)
    }

    // --- Analysis and draft audit rows ---

    pub fn analysis(&self, item_id: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        self.get(Table::Analyses, item_id)
    }

    pub fn put_analysis(&self, record: &AnalysisRecord) -> Result<(), StoreError> {
        self.put(Table::Analyses, &record.item_id, record, None)
    }

    pub fn analyses(&self) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.scan(Table::Analyses, "")
    }

    pub fn update_analysis<F>(&self, item_id: &str, f: F) -> Result<Option<AnalysisRecord>, StoreError>
    where
        F: FnOnce(&mut AnalysisRecord) -> bool,
    {
        self.update(Table::Analyses, item_id, None, |current: Option<AnalysisRecord>| {
            let mut record = current?;
            f(&mut record).then_some(record)
        })
    }

    pub fn draft(&self, item_id: &str) -> Result<Option<DraftRecord>, StoreError> {
        self.get(Table::Drafts, item_id)
    }

    pub fn put_draft(&self, record: &DraftRecord) -> Result<(), StoreError> {
        self.put(Table::Drafts, &record.item_id, record, None)
    }

    pub fn drafts(&self) -> Result<Vec<DraftRecord>, StoreError> {
        self.scan(Table::Drafts, "")
    }

    pub fn update_draft<F>(&self, item_id: &str, f: F) -> Result<Option<DraftRecord>, StoreError>
    where
        F: FnOnce(&mut DraftRecord) -> bool,
    {
        self.update(Table::Drafts, item_id, None, |current: Option<DraftRecord>| {
            let mut record = current?;
            f(&mut record).then_some(record)
        })
    }

    // --- Metrics cache ---

    pub fn cached_metrics(&self, cache_key: &str) -> Result<Option<Metrics>, StoreError> {
        self.get(Table::Cache, cache_key)
    }

    pub fn cache_metrics(&self, cache_key: &str, metrics: &Metrics, ttl: Duration) -> Result<(), StoreError> {
        self.put(Table::Cache, cache_key, metrics, Some(ttl))
    }
}

pub fn draft_artifact_key(item_id: &str) -> String {
    format!("draft:{}", item_id)
}
