use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

/// Lifecycle of a prioritization job. Every status except `Running` is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Complete,
    Cancelled,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Only `Running` may move, and only to a terminal status.
    pub fn is_valid_transition(&self, to: &JobStatus) -> bool {
        *self == JobStatus::Running && to.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzing,
    Completed,
    Error,
    /// Orphaned `analyzing` detected inside the reconciler grace window.
    Interrupted,
}

impl AnalysisStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, AnalysisStatus::Analyzing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Pending,
    Creating,
    Completed,
    Error,
    /// Orphaned `creating` detected inside the reconciler grace window.
    Interrupted,
}

impl DraftStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, DraftStatus::Creating)
    }

    /// Validates a draft status transition.
    ///
    /// Rules:
    /// - Pending, Error and Interrupted may start creating
    /// - Creating ends in Completed or Error
    /// - Completed returns to Pending once the artifact is reviewed
    /// - The reconciler may move Creating back to Pending or Interrupted
    pub fn is_valid_transition(&self, to: &DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, to),
            (Pending | Error | Interrupted, Creating)
                | (Creating, Completed | Error | Pending | Interrupted)
                | (Completed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Creating => "creating",
            DraftStatus::Completed => "completed",
            DraftStatus::Error => "error",
            DraftStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    match s.to_lowercase().as_str() {
        "running" => Ok(JobStatus::Running),
        "complete" => Ok(JobStatus::Complete),
        "cancelled" => Ok(JobStatus::Cancelled),
        "failed" => Ok(JobStatus::Failed),
        "timeout" => Ok(JobStatus::Timeout),
        _ => Err(format!(
            "Invalid job status '{}': expected running, complete, cancelled, failed, or timeout",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

// --- Metrics and scoring records ---

/// Search metrics for one key over one measurement window.
///
/// `ctr` is a fraction (0.0..=1.0), `position` the average SERP position.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Metrics {
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

impl Metrics {
    pub fn is_empty(&self) -> bool {
        self.clicks == 0 && self.impressions == 0
    }
}

/// The persisted scoring/status row for one content item.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TrackedItem {
    pub item_id: String,
    #[serde(default)]
    pub current: Metrics,
    #[serde(default)]
    pub previous: Metrics,
    #[serde(default)]
    pub content_age_score: u32,
    #[serde(default)]
    pub traffic_decline_score: u32,
    #[serde(default)]
    pub traffic_potential_score: u32,
    #[serde(default)]
    pub priority_score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_error: Option<String>,
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub draft_status: DraftStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<u32>,
}

impl TrackedItem {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            ..Default::default()
        }
    }
}

// --- Leases ---

/// A TTL-backed mutual-exclusion marker for one resource key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LeaseRecord {
    pub key: String,
    /// Unique per acquisition; guards token-checked release.
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl LeaseRecord {
    /// A lease is abandoned once `now - issued_at` exceeds its TTL.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.issued_at);
        age.num_milliseconds() > i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }
}

// --- Generation telemetry ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub model: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Finding {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: String,
    pub summary: String,
    #[serde(default)]
    pub recommendation: String,
}

/// Audit row for the latest analysis of one item. Replaced on re-analysis.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisRecord {
    pub item_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub issue_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn started(item_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            status: AnalysisStatus::Analyzing,
            findings: Vec::new(),
            issue_count: 0,
            usage: None,
            cost_usd: 0.0,
            error_message: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Audit row for the latest draft of one item. Replaced on re-creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DraftRecord {
    pub item_id: String,
    pub status: DraftStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewDecision>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DraftRecord {
    pub fn started(item_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            status: DraftStatus::Creating,
            artifact_ref: None,
            usage: None,
            cost_usd: 0.0,
            error_message: None,
            review: None,
            started_at: now,
            updated_at: now,
        }
    }
}

// --- Jobs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchError {
    pub batch: u32,
    pub item_id: String,
    pub message: String,
}

/// One run of the prioritization workflow across the whole catalog.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub processed_count: usize,
    pub current_batch: u32,
    pub total_batches: u32,
    pub batch_size: usize,
    pub success_count: usize,
    pub cache_hit_count: usize,
    #[serde(default)]
    pub errors: Vec<BatchError>,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn new(job_id: String, total_items: usize, batch_size: usize, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Running,
            total_items,
            processed_count: 0,
            current_batch: 0,
            total_batches: total_batches(total_items, batch_size),
            batch_size,
            success_count: 0,
            cache_hit_count: 0,
            errors: Vec::new(),
            started_at: now,
            last_update_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Move a running job to a terminal status. Returns false (and changes
    /// nothing) when the job already left `Running`.
    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) -> bool {
        if !self.status.is_valid_transition(&status) {
            return false;
        }
        self.status = status;
        self.completed_at = Some(now);
        self.last_update_at = now;
        true
    }
}

/// `ceil(total_items / batch_size)`; zero-sized batches count as one item each.
pub fn total_batches(total_items: usize, batch_size: usize) -> u32 {
    let size = batch_size.max(1);
    total_items.div_ceil(size) as u32
}

static JOB_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Time-derived job id, e.g. `job-20261019T101500123-4242-0`.
pub fn next_job_id(now: DateTime<Utc>) -> String {
    format!(
        "job-{}-{}-{}",
        now.format("%Y%m%dT%H%M%S%3f"),
        std::process::id(),
        JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Payload of one durable batch task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BatchTask {
    pub job_id: String,
    pub batch_number: u32,
    pub offset: usize,
    pub batch_size: usize,
}

/// Snapshot returned by progress queries. Never an error.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    Idle,
    Active(Job),
    Unavailable(String),
}

impl Progress {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Progress::Idle => serde_json::json!({ "status": "idle" }),
            Progress::Active(job) => serde_json::to_value(job)
                .unwrap_or_else(|e| serde_json::json!({ "status": "unavailable", "reason": e.to_string() })),
            Progress::Unavailable(reason) => {
                serde_json::json!({ "status": "unavailable", "reason": reason })
            }
        }
    }
}
