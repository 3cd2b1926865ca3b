use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::lease::LeaseOptions;

pub const CONFIG_FILE: &str = "refresh-golem.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GolemConfig {
    pub project: ProjectConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub lease: LeaseConfig,
    pub reconcile: ReconcileConfig,
    pub generator: GeneratorConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory holding the durable store, relative to the project root.
    pub state_dir: String,
    pub catalog_path: String,
    pub worklog_dir: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub job_ttl_hours: u64,
    pub stale_job_minutes: u64,
    pub max_task_attempts: u32,
    pub task_retry_base_ms: u64,
    pub visibility_timeout_minutes: u64,
    pub poll_interval_ms: u64,
    pub max_recorded_errors: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub success_ttl_hours: u64,
    pub empty_ttl_hours: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// argv of the metrics fetcher.
    pub command: Vec<String>,
    pub window_days: u32,
    pub data_lag_days: u32,
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    pub analysis_ttl_minutes: u64,
    pub draft_ttl_minutes: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interrupted_grace_seconds: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: Vec<String>,
    pub model: Option<String>,
    pub timeout_minutes: u64,
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
    pub min_length_ratio: f64,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            state_dir: ".refresh-golem".to_string(),
            catalog_path: "catalog.jsonl".to_string(),
            worklog_dir: "_worklog".to_string(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            job_ttl_hours: 24,
            stale_job_minutes: 60,
            max_task_attempts: 3,
            task_retry_base_ms: 1000,
            visibility_timeout_minutes: 15,
            poll_interval_ms: 500,
            max_recorded_errors: 500,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            success_ttl_hours: 24,
            empty_ttl_hours: 1,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            window_days: 28,
            data_lag_days: 3,
            timeout_seconds: 60,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            analysis_ttl_minutes: 20,
            draft_ttl_minutes: 20,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interrupted_grace_seconds: 120,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            model: None,
            timeout_minutes: 10,
            prompt_cost_per_1k: 0.003,
            completion_cost_per_1k: 0.015,
            min_length_ratio: 0.5,
        }
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

impl BatchConfig {
    pub fn job_ttl(&self) -> Duration {
        hours(self.job_ttl_hours)
    }

    pub fn stale_after(&self) -> Duration {
        minutes(self.stale_job_minutes)
    }

    pub fn visibility_timeout(&self) -> Duration {
        minutes(self.visibility_timeout_minutes)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.task_retry_base_ms)
    }
}

impl CacheConfig {
    pub fn success_ttl(&self) -> Duration {
        hours(self.success_ttl_hours)
    }

    pub fn empty_ttl(&self) -> Duration {
        hours(self.empty_ttl_hours)
    }
}

impl MetricsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl LeaseConfig {
    pub fn analysis(&self) -> LeaseOptions {
        LeaseOptions {
            ttl: minutes(self.analysis_ttl_minutes),
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn draft(&self) -> LeaseOptions {
        LeaseOptions {
            ttl: minutes(self.draft_ttl_minutes),
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl ReconcileConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.interrupted_grace_seconds)
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        minutes(self.timeout_minutes)
    }

    /// USD cost of one call from its token counts.
    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.prompt_cost_per_1k
            + completion_tokens as f64 / 1000.0 * self.completion_cost_per_1k
    }
}

impl GolemConfig {
    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.project.state_dir)
    }

    pub fn catalog_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.project.catalog_path)
    }

    pub fn worklog_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.project.worklog_dir)
    }
}

pub fn validate(config: &GolemConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.project.state_dir.trim().is_empty() {
        errors.push("project.state_dir must not be empty".to_string());
    }
    if config.project.catalog_path.trim().is_empty() {
        errors.push("project.catalog_path must not be empty".to_string());
    }

    let batch = &config.batch;
    if !(1..=1000).contains(&batch.batch_size) {
        errors.push(format!(
            "batch.batch_size must be between 1 and 1000 (got {})",
            batch.batch_size
        ));
    }
    for (name, value) in [
        ("batch.job_ttl_hours", batch.job_ttl_hours),
        ("batch.stale_job_minutes", batch.stale_job_minutes),
        ("batch.visibility_timeout_minutes", batch.visibility_timeout_minutes),
        ("batch.poll_interval_ms", batch.poll_interval_ms),
        ("cache.success_ttl_hours", config.cache.success_ttl_hours),
        ("cache.empty_ttl_hours", config.cache.empty_ttl_hours),
        ("metrics.timeout_seconds", config.metrics.timeout_seconds),
        ("lease.analysis_ttl_minutes", config.lease.analysis_ttl_minutes),
        ("lease.draft_ttl_minutes", config.lease.draft_ttl_minutes),
        ("generator.timeout_minutes", config.generator.timeout_minutes),
    ] {
        if value == 0 {
            errors.push(format!("{} must be >= 1", name));
        }
    }
    if batch.max_task_attempts < 1 {
        errors.push("batch.max_task_attempts must be >= 1".to_string());
    }
    if config.lease.max_attempts < 1 {
        errors.push("lease.max_attempts must be >= 1".to_string());
    }
    if config.metrics.window_days < 1 {
        errors.push("metrics.window_days must be >= 1".to_string());
    }

    let generator = &config.generator;
    if generator.timeout_minutes >= config.lease.draft_ttl_minutes {
        errors.push(format!(
            "generator.timeout_minutes ({}) must be shorter than lease.draft_ttl_minutes ({})",
            generator.timeout_minutes, config.lease.draft_ttl_minutes
        ));
    }
    if generator.timeout_minutes >= config.lease.analysis_ttl_minutes {
        errors.push(format!(
            "generator.timeout_minutes ({}) must be shorter than lease.analysis_ttl_minutes ({})",
            generator.timeout_minutes, config.lease.analysis_ttl_minutes
        ));
    }
    if !(0.0..=1.0).contains(&generator.min_length_ratio) {
        errors.push(format!(
            "generator.min_length_ratio must be between 0.0 and 1.0 (got {})",
            generator.min_length_ratio
        ));
    }
    if generator.prompt_cost_per_1k < 0.0 || generator.completion_cost_per_1k < 0.0 {
        errors.push("generator costs must not be negative".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load `refresh-golem.toml` from the project root. A missing file yields
/// defaults.
pub fn load_config(project_root: &Path) -> Result<GolemConfig, String> {
    load_config_from(&project_root.join(CONFIG_FILE))
}

pub fn load_config_from(config_path: &Path) -> Result<GolemConfig, String> {
    if !config_path.exists() {
        return Ok(GolemConfig::default());
    }

    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: GolemConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

/// Commented starter config written by `refresh-golem init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# refresh-golem configuration

[project]
state_dir = ".refresh-golem"
catalog_path = "catalog.jsonl"
worklog_dir = "_worklog"

[batch]
batch_size = 100
job_ttl_hours = 24
stale_job_minutes = 60
max_task_attempts = 3
task_retry_base_ms = 1000
visibility_timeout_minutes = 15
poll_interval_ms = 500
max_recorded_errors = 500

[cache]
success_ttl_hours = 24
empty_ttl_hours = 1

[metrics]
# argv of the metrics fetcher, e.g. ["fetch-metrics", "--site", "example.com"]
command = []
window_days = 28
data_lag_days = 3
timeout_seconds = 60

[lease]
analysis_ttl_minutes = 20
draft_ttl_minutes = 20
max_attempts = 3
backoff_ms = 500

[reconcile]
interrupted_grace_seconds = 120

[generator]
# argv of the content generator; the prompt is written to its stdin
command = []
# model = "model-name"
timeout_minutes = 10
prompt_cost_per_1k = 0.003
completion_cost_per_1k = 0.015
min_length_ratio = 0.5
"#;
