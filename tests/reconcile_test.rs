mod common;

use std::time::Duration;

use chrono::Utc;

use refresh_golem::lease::{analysis_key, draft_key, LeaseOptions};
use refresh_golem::metrics::MockMetricsSource;
use refresh_golem::reconcile::{Operation, ResetTarget, StatusReconciler};
use refresh_golem::types::{AnalysisRecord, AnalysisStatus, DraftRecord, DraftStatus};

use common::Harness;

const GRACE: Duration = Duration::from_secs(120);

fn harness() -> Harness {
    Harness::new(vec![], MockMetricsSource::new())
}

fn reconciler(h: &Harness) -> StatusReconciler {
    StatusReconciler::new(h.records.clone(), h.leases(), GRACE)
}

fn analyzing_since(h: &Harness, item_id: &str, ago: chrono::Duration) {
    h.records
        .update_item(item_id, |row| {
            row.analysis_status = AnalysisStatus::Analyzing;
            row.analysis_updated_at = Some(Utc::now() - ago);
        })
        .unwrap();
}

fn creating_since(h: &Harness, item_id: &str, ago: chrono::Duration) {
    h.records
        .update_item(item_id, |row| {
            row.draft_status = DraftStatus::Creating;
            row.draft_updated_at = Some(Utc::now() - ago);
        })
        .unwrap();
}

#[tokio::test]
async fn live_lease_leaves_item_in_progress() {
    let h = harness();
    analyzing_since(&h, "a", chrono::Duration::hours(1));
    let _guard = h
        .leases()
        .acquire(&analysis_key("a"), &LeaseOptions::default())
        .await
        .unwrap()
        .unwrap();

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.inspected, 1);
    assert_eq!(report.still_running, 1);
    assert!(report.resets.is_empty());
    assert_eq!(
        h.records.tracked_item("a").unwrap().unwrap().analysis_status,
        AnalysisStatus::Analyzing
    );
}

#[test]
fn old_orphan_is_reset_to_pending() {
    let h = harness();
    analyzing_since(&h, "a", chrono::Duration::hours(1));
    creating_since(&h, "b", chrono::Duration::hours(1));

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.resets.len(), 2);
    assert!(report
        .resets
        .iter()
        .all(|r| r.target == ResetTarget::Pending && !r.audit_row));

    let a = h.records.tracked_item("a").unwrap().unwrap();
    let b = h.records.tracked_item("b").unwrap().unwrap();
    assert_eq!(a.analysis_status, AnalysisStatus::Pending);
    assert_eq!(b.draft_status, DraftStatus::Pending);
}

#[test]
fn recent_orphan_is_marked_interrupted() {
    let h = harness();
    creating_since(&h, "a", chrono::Duration::seconds(10));

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.resets.len(), 1);
    assert_eq!(report.resets[0].operation, Operation::Draft);
    assert_eq!(report.resets[0].target, ResetTarget::Interrupted);
    assert_eq!(
        h.records.tracked_item("a").unwrap().unwrap().draft_status,
        DraftStatus::Interrupted
    );
}

#[test]
fn reset_touches_only_the_orphaned_field() {
    let h = harness();
    analyzing_since(&h, "a", chrono::Duration::hours(1));
    h.records
        .update_item("a", |row| {
            row.draft_status = DraftStatus::Completed;
            row.priority_score = 42;
            row.display_order = Some(3);
        })
        .unwrap();

    reconciler(&h).reconcile().unwrap();

    let row = h.records.tracked_item("a").unwrap().unwrap();
    assert_eq!(row.analysis_status, AnalysisStatus::Pending);
    assert_eq!(row.draft_status, DraftStatus::Completed);
    assert_eq!(row.priority_score, 42);
    assert_eq!(row.display_order, Some(3));
}

#[test]
fn audit_records_are_reset_with_message() {
    let h = harness();
    let started = Utc::now() - chrono::Duration::hours(2);
    h.records
        .put_analysis(&AnalysisRecord::started("a", started))
        .unwrap();
    h.records.put_draft(&DraftRecord::started("b", started)).unwrap();

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.resets.iter().filter(|r| r.audit_row).count(), 2);

    let analysis = h.records.analysis("a").unwrap().unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Pending);
    assert!(analysis.error_message.unwrap().contains("Interrupted"));
    let draft = h.records.draft("b").unwrap().unwrap();
    assert_eq!(draft.status, DraftStatus::Pending);
}

#[test]
fn terminal_statuses_are_ignored() {
    let h = harness();
    h.records
        .set_analysis_status("a", AnalysisStatus::Completed)
        .unwrap();
    h.records.set_draft_status("a", DraftStatus::Error).unwrap();

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.inspected, 0);
    assert!(report.resets.is_empty());
}

#[test]
fn second_pass_finds_nothing() {
    let h = harness();
    creating_since(&h, "a", chrono::Duration::hours(1));
    assert_eq!(reconciler(&h).reconcile().unwrap().resets.len(), 1);
    assert!(reconciler(&h).reconcile().unwrap().resets.is_empty());
}

#[tokio::test]
async fn stale_lease_does_not_protect_item() {
    let h = harness();
    creating_since(&h, "a", chrono::Duration::hours(1));
    let opts = LeaseOptions {
        ttl: Duration::from_millis(1),
        ..LeaseOptions::default()
    };
    let guard = h.leases().acquire(&draft_key("a"), &opts).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = reconciler(&h).reconcile().unwrap();
    assert_eq!(report.resets.len(), 1);
    drop(guard);
}
