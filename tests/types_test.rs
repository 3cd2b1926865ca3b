mod common;

use std::collections::HashSet;

use refresh_golem::types::*;

use common::fixed_time;

// --- Status transitions ---

#[test]
fn only_running_jobs_can_move() {
    assert!(JobStatus::Running.is_valid_transition(&JobStatus::Complete));
    assert!(JobStatus::Running.is_valid_transition(&JobStatus::Timeout));
    assert!(!JobStatus::Running.is_valid_transition(&JobStatus::Running));
    assert!(!JobStatus::Complete.is_valid_transition(&JobStatus::Cancelled));
    assert!(!JobStatus::Failed.is_valid_transition(&JobStatus::Complete));
}

#[test]
fn draft_transitions_follow_review_cycle() {
    use DraftStatus::*;
    assert!(Pending.is_valid_transition(&Creating));
    assert!(Error.is_valid_transition(&Creating));
    assert!(Interrupted.is_valid_transition(&Creating));
    assert!(Creating.is_valid_transition(&Completed));
    assert!(Completed.is_valid_transition(&Pending));

    assert!(!Completed.is_valid_transition(&Creating));
    assert!(!Pending.is_valid_transition(&Completed));
}

#[test]
fn parse_job_status_is_case_insensitive() {
    assert_eq!(parse_job_status("Running").unwrap(), JobStatus::Running);
    assert_eq!(parse_job_status("TIMEOUT").unwrap(), JobStatus::Timeout);
    assert!(parse_job_status("paused").unwrap_err().contains("Invalid job status"));
}

#[test]
fn statuses_serialize_snake_case() {
    assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
    assert_eq!(serde_json::to_string(&AnalysisStatus::Interrupted).unwrap(), "\"interrupted\"");
    assert_eq!(serde_json::to_string(&ReviewDecision::Approved).unwrap(), "\"approved\"");
}

// --- Jobs ---

#[test]
fn total_batches_rounds_up() {
    assert_eq!(total_batches(250, 100), 3);
    assert_eq!(total_batches(200, 100), 2);
    assert_eq!(total_batches(0, 100), 0);
    assert_eq!(total_batches(3, 0), 3);
}

#[test]
fn finish_only_moves_running_jobs() {
    let start = fixed_time(2026, 3, 1);
    let end = fixed_time(2026, 3, 2);
    let mut job = Job::new("job-1".to_string(), 10, 4, start);
    assert_eq!(job.total_batches, 3);
    assert!(job.is_running());

    assert!(job.finish(JobStatus::Cancelled, end));
    assert_eq!(job.completed_at, Some(end));
    assert_eq!(job.last_update_at, end);

    assert!(!job.finish(JobStatus::Complete, start));
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.completed_at, Some(end));
}

#[test]
fn job_ids_are_unique_within_one_instant() {
    let now = fixed_time(2026, 3, 1);
    let ids: HashSet<String> = (0..100).map(|_| next_job_id(now)).collect();
    assert_eq!(ids.len(), 100);
    assert!(ids.iter().all(|id| id.starts_with("job-20260301T120000000-")));
}

// --- Records ---

#[test]
fn lease_goes_stale_after_ttl() {
    let issued = fixed_time(2026, 3, 1);
    let lease = LeaseRecord {
        key: "analyze:p-1".to_string(),
        token: "t".to_string(),
        issued_at: issued,
        ttl_ms: 1_000,
    };
    assert!(!lease.is_stale(issued + chrono::Duration::milliseconds(1_000)));
    assert!(lease.is_stale(issued + chrono::Duration::milliseconds(1_001)));
}

#[test]
fn tracked_item_tolerates_missing_fields() {
    let item: TrackedItem = serde_json::from_str(r#"{"item_id": "p-1"}"#).unwrap();
    assert_eq!(item, TrackedItem::new("p-1"));
    assert_eq!(item.analysis_status, AnalysisStatus::Pending);
    assert_eq!(item.draft_status, DraftStatus::Pending);
}

#[test]
fn empty_metrics_have_no_clicks_or_impressions() {
    assert!(Metrics::default().is_empty());
    assert!(!Metrics {
        impressions: 1,
        ..Metrics::default()
    }
    .is_empty());
}

// --- Progress ---

#[test]
fn progress_json_shapes() {
    assert_eq!(Progress::Idle.to_json()["status"], "idle");

    let unavailable = Progress::Unavailable("store down".to_string()).to_json();
    assert_eq!(unavailable["status"], "unavailable");
    assert_eq!(unavailable["reason"], "store down");

    let job = Job::new("job-1".to_string(), 5, 5, fixed_time(2026, 3, 1));
    let active = Progress::Active(job).to_json();
    assert_eq!(active["status"], "running");
    assert_eq!(active["total_batches"], 1);
    assert!(active.get("completed_at").is_none());
}
