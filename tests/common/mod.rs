#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use refresh_golem::agent::{Generation, MockGenerator};
use refresh_golem::catalog::{Catalog, ContentItem, MemoryCatalog};
use refresh_golem::config::GeneratorConfig;
use refresh_golem::lease::{LeaseManager, LeaseOptions};
use refresh_golem::metrics::MockMetricsSource;
use refresh_golem::orchestrator::{BatchOrchestrator, OrchestratorSettings};
use refresh_golem::processor::{ItemProcessor, ProcessorSettings};
use refresh_golem::queue::{StoreTaskQueue, TaskQueue};
use refresh_golem::records::Records;
use refresh_golem::error::StoreError;
use refresh_golem::store::{MemoryStore, Store, Table, UpdateFn};
use refresh_golem::types::{Metrics, Usage};
use refresh_golem::worker::{Worker, WorkerSettings};

/// Creates a `ContentItem` published `age_days` ago.
///
/// The URL is `https://example.com/{id}` and the body is a short
/// multi-line text unique to the item.
pub fn make_item(id: &str, age_days: i64) -> ContentItem {
    ContentItem {
        id: id.to_string(),
        url: item_url(id),
        title: format!("Post {}", id),
        published_at: Utc::now() - chrono::Duration::days(age_days),
        modified_at: None,
        body: format!("# Post {}\n\nFirst paragraph.\n\nSecond paragraph.", id),
    }
}

pub fn item_url(id: &str) -> String {
    format!("https://example.com/{}", id)
}

/// `count` items with ids `p-0000`, `p-0001`, ... all two years old.
pub fn make_items(count: usize) -> Vec<ContentItem> {
    (0..count)
        .map(|i| make_item(&format!("p-{:04}", i), 730))
        .collect()
}

pub fn metrics(clicks: u64, impressions: u64, ctr: f64, position: f64) -> Metrics {
    Metrics {
        clicks,
        impressions,
        ctr,
        position,
    }
}

pub fn fixed_time(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn generation(text: &str, prompt_tokens: u64, completion_tokens: u64) -> Generation {
    Generation {
        text: text.to_string(),
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model: "test-model".to_string(),
        },
    }
}

/// Lease options tuned for tests: short TTL and backoff.
pub fn fast_lease(ttl_ms: u64, max_attempts: u32) -> LeaseOptions {
    LeaseOptions {
        ttl: Duration::from_millis(ttl_ms),
        max_attempts,
        backoff: Duration::from_millis(10),
    }
}

pub fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        command: vec!["generate".to_string()],
        prompt_cost_per_1k: 0.01,
        completion_cost_per_1k: 0.02,
        ..GeneratorConfig::default()
    }
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        visibility_timeout: Duration::from_secs(60),
        max_attempts: 3,
        retry_base: Duration::from_millis(0),
        poll_interval: Duration::from_millis(5),
    }
}

/// An in-memory store with every collaborator wired to it.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub records: Records,
    pub catalog: Arc<dyn Catalog>,
    pub queue: Arc<dyn TaskQueue>,
    pub source: Arc<MockMetricsSource>,
}

impl Harness {
    pub fn new(items: Vec<ContentItem>, source: MockMetricsSource) -> Self {
        Self::with_catalog(MemoryCatalog::new(items), source)
    }

    pub fn with_catalog(catalog: MemoryCatalog, source: MockMetricsSource) -> Self {
        Self::with_store(catalog, source, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(catalog: MemoryCatalog, source: MockMetricsSource, store: Arc<dyn Store>) -> Self {
        Self {
            records: Records::new(Arc::clone(&store)),
            queue: Arc::new(StoreTaskQueue::new(Arc::clone(&store))),
            catalog: Arc::new(catalog),
            source: Arc::new(source),
            store,
        }
    }

    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(Arc::clone(&self.store))
    }

    pub fn processor(&self) -> ItemProcessor<MockMetricsSource> {
        ItemProcessor::new(
            self.records.clone(),
            Arc::clone(&self.source),
            ProcessorSettings::default(),
        )
    }

    pub fn orchestrator(&self, batch_size: usize) -> BatchOrchestrator<MockMetricsSource> {
        BatchOrchestrator::new(
            self.records.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.queue),
            self.processor(),
            OrchestratorSettings {
                batch_size,
                ..OrchestratorSettings::default()
            },
        )
    }

    pub fn worker(
        &self,
        orchestrator: Arc<BatchOrchestrator<MockMetricsSource>>,
    ) -> Worker<MockMetricsSource> {
        Worker::new(orchestrator, Arc::clone(&self.queue), worker_settings())
    }

    pub fn generator(&self, results: Vec<Result<Generation, String>>) -> Arc<MockGenerator> {
        Arc::new(MockGenerator::new(results))
    }
}

/// A `MemoryStore` whose `put` on one table starts failing with
/// "disk full" once `allowed_puts` writes to that table have succeeded.
pub struct FailingPuts {
    inner: MemoryStore,
    table: Table,
    allowed_puts: AtomicUsize,
}

impl FailingPuts {
    pub fn new(table: Table, allowed_puts: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            table,
            allowed_puts: AtomicUsize::new(allowed_puts),
        }
    }
}

impl Store for FailingPuts {
    fn get(&self, table: Table, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.get(table, key)
    }

    fn put(
        &self,
        table: Table,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if table == self.table
            && self
                .allowed_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.put(table, key, value, ttl)
    }

    fn insert_if_absent(
        &self,
        table: Table,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.inner.insert_if_absent(table, key, value, ttl)
    }

    fn remove(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.inner.remove(table, key)
    }

    fn remove_if(
        &self,
        table: Table,
        key: &str,
        pred: &dyn Fn(&serde_json::Value) -> bool,
    ) -> Result<bool, StoreError> {
        self.inner.remove_if(table, key, pred)
    }

    fn update(
        &self,
        table: Table,
        key: &str,
        ttl: Option<Duration>,
        apply: &mut UpdateFn<'_>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.update(table, key, ttl, apply)
    }

    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        self.inner.scan(table, prefix)
    }
}
