mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use refresh_golem::metrics::MockMetricsSource;
use refresh_golem::queue::NewTask;
use refresh_golem::reconcile::StatusReconciler;
use refresh_golem::types::{AnalysisStatus, JobStatus};
use refresh_golem::worker::{HaltReason, RunMode, TaskReport};

use common::{make_items, Harness};

#[tokio::test]
async fn run_once_on_empty_queue_returns_none() {
    let h = Harness::new(make_items(1), MockMetricsSource::new());
    let worker = h.worker(Arc::new(h.orchestrator(10)));
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn run_once_completes_and_acks_a_batch() {
    let h = Harness::new(make_items(3), MockMetricsSource::new());
    let orchestrator = Arc::new(h.orchestrator(10));
    orchestrator.start().await.unwrap();
    let worker = h.worker(Arc::clone(&orchestrator));

    let report = worker.run_once().await.unwrap().unwrap();
    assert!(matches!(report, TaskReport::Completed { .. }));
    assert_eq!(h.queue.pending(None).unwrap(), 0);
    assert_eq!(h.records.current_job().unwrap().unwrap().status, JobStatus::Complete);
}

#[tokio::test]
async fn unknown_task_is_retried_then_dropped() {
    let h = Harness::new(make_items(1), MockMetricsSource::new());
    let worker = h.worker(Arc::new(h.orchestrator(10)));
    h.queue
        .enqueue(NewTask {
            key: "mystery:1".to_string(),
            name: "mystery".to_string(),
            group: "mystery".to_string(),
            payload: json!({}),
        })
        .unwrap();

    let first = worker.run_once().await.unwrap().unwrap();
    assert!(matches!(first, TaskReport::Retried { attempt: 1, .. }));
    worker.run_once().await.unwrap();
    let last = worker.run_once().await.unwrap().unwrap();
    assert!(matches!(last, TaskReport::Exhausted { attempts: 3, .. }));
    assert_eq!(h.queue.pending(None).unwrap(), 0);
}

#[tokio::test]
async fn forever_mode_stops_on_cancellation() {
    let h = Harness::new(make_items(1), MockMetricsSource::new());
    let worker = h.worker(Arc::new(h.orchestrator(10)));
    let cancel = CancellationToken::new();

    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let summary = tokio::time::timeout(Duration::from_secs(5), worker.run(cancel, RunMode::Forever))
        .await
        .expect("worker should stop once cancelled")
        .unwrap();
    stopper.await.unwrap();
    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.drains, 1, "drain hooks run once per dry spell");
}

#[tokio::test]
async fn drain_runs_reconciler() {
    let h = Harness::new(make_items(1), MockMetricsSource::new());
    h.records
        .update_item("p-0000", |row| {
            row.analysis_status = AnalysisStatus::Analyzing;
            row.analysis_updated_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        })
        .unwrap();
    let reconciler = StatusReconciler::new(h.records.clone(), h.leases(), Duration::from_secs(60));
    let worker = h
        .worker(Arc::new(h.orchestrator(10)))
        .with_reconciler(reconciler);

    let summary = worker
        .run(CancellationToken::new(), RunMode::UntilIdle)
        .await
        .unwrap();
    assert_eq!(summary.halt_reason, HaltReason::Idle);
    assert_eq!(summary.drains, 1);

    let row = h.records.tracked_item("p-0000").unwrap().unwrap();
    assert_eq!(row.analysis_status, AnalysisStatus::Pending);
}
