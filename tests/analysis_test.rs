mod common;

use std::sync::Arc;
use std::time::Duration;

use refresh_golem::agent::MockGenerator;
use refresh_golem::catalog::MemoryCatalog;
use refresh_golem::analysis::AnalysisPipeline;
use refresh_golem::error::GolemError;
use refresh_golem::lease::analysis_key;
use refresh_golem::metrics::MockMetricsSource;
use refresh_golem::store::Table;
use refresh_golem::types::AnalysisStatus;

use common::{
    fast_lease, generation, generator_config, item_url, make_item, metrics, FailingPuts, Harness,
};

const FINDINGS: &str = r#"{"findings": [
  {"category": "facts", "severity": "high", "summary": "Prices are from 2023", "recommendation": "Update the table"},
  {"category": "seo", "severity": "low", "summary": "Title is generic"}
]}"#;

fn pipeline(h: &Harness, generator: Arc<MockGenerator>) -> AnalysisPipeline<MockGenerator, MockMetricsSource> {
    AnalysisPipeline::new(
        h.records.clone(),
        h.leases(),
        Arc::clone(&h.catalog),
        h.processor(),
        generator,
        fast_lease(60_000, 2),
        generator_config(),
    )
}

#[tokio::test]
async fn analysis_records_findings_and_cost() {
    let source = MockMetricsSource::new().with_metrics(&item_url("p-1"), metrics(10, 500, 0.02, 6.0));
    let h = Harness::new(vec![make_item("p-1", 400)], source);
    let generator = h.generator(vec![Ok(generation(FINDINGS, 1000, 500))]);

    let record = pipeline(&h, Arc::clone(&generator)).analyze("p-1").await.unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.issue_count, 2);
    assert_eq!(record.findings[0].summary, "Prices are from 2023");
    assert!((record.cost_usd - 0.02).abs() < 1e-9);
    assert_eq!(record.usage.as_ref().unwrap().total_tokens, 1500);

    let row = h.records.tracked_item("p-1").unwrap().unwrap();
    assert_eq!(row.analysis_status, AnalysisStatus::Completed);
    assert!(row.scored_at.is_some(), "metrics are refreshed before analysis");
    assert_eq!(h.records.analysis("p-1").unwrap().unwrap(), record);
    assert!(!h.leases().is_live(&analysis_key("p-1")).unwrap());

    let prompt = &generator.prompts()[0];
    assert!(prompt.contains("https://example.com/p-1"));
}

#[tokio::test]
async fn generator_failure_leaves_item_in_error() {
    let h = Harness::new(vec![make_item("p-1", 10)], MockMetricsSource::new());
    let generator = h.generator(vec![Err("rate limited".to_string())]);

    let err = pipeline(&h, generator).analyze("p-1").await.unwrap_err();
    assert!(matches!(err, GolemError::Generation(ref m) if m == "rate limited"));

    let row = h.records.tracked_item("p-1").unwrap().unwrap();
    assert_eq!(row.analysis_status, AnalysisStatus::Error);
    let record = h.records.analysis("p-1").unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Error);
    assert!(record.error_message.unwrap().contains("rate limited"));
    assert!(!h.leases().is_live(&analysis_key("p-1")).unwrap());
}

#[tokio::test]
async fn unparseable_output_is_an_analysis_error() {
    let h = Harness::new(vec![make_item("p-1", 10)], MockMetricsSource::new());
    let generator = h.generator(vec![Ok(generation("I could not find any issues.", 10, 10))]);

    let err = pipeline(&h, generator).analyze("p-1").await.unwrap_err();
    assert!(matches!(err, GolemError::Analysis(_)));
    assert_eq!(
        h.records.tracked_item("p-1").unwrap().unwrap().analysis_status,
        AnalysisStatus::Error
    );
}

#[tokio::test]
async fn metrics_failure_does_not_block_analysis() {
    let source = MockMetricsSource::new().failing(&item_url("p-1"), "quota exceeded");
    let h = Harness::new(vec![make_item("p-1", 10)], source);
    let generator = h.generator(vec![Ok(generation(FINDINGS, 1, 1))]);

    let record = pipeline(&h, generator).analyze("p-1").await.unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
}

#[tokio::test]
async fn unknown_item_is_rejected_before_locking() {
    let h = Harness::new(vec![], MockMetricsSource::new());
    let generator = h.generator(vec![]);

    let err = pipeline(&h, Arc::clone(&generator)).analyze("ghost").await.unwrap_err();
    assert!(matches!(err, GolemError::ItemNotFound(_)));
    assert_eq!(generator.call_count(), 0);
    assert!(h.records.tracked_item("ghost").unwrap().is_none());
}

#[tokio::test]
async fn concurrent_analysis_of_same_item_runs_once() {
    let h = Harness::new(vec![make_item("p-1", 10)], MockMetricsSource::new());
    let generator = Arc::new(
        MockGenerator::new(vec![Ok(generation(FINDINGS, 1, 1)), Ok(generation(FINDINGS, 1, 1))])
            .with_delay(Duration::from_millis(100)),
    );
    let first = pipeline(&h, Arc::clone(&generator));
    let second = pipeline(&h, Arc::clone(&generator));

    let (a, b) = tokio::join!(first.analyze("p-1"), second.analyze("p-1"));
    let errors: Vec<GolemError> = [a, b].into_iter().filter_map(Result::err).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], GolemError::InProgress { .. }));
    assert!(errors[0].is_contention());
    assert_eq!(generator.call_count(), 1);
}

fn harness_with_failing_analyses(allowed_puts: usize) -> Harness {
    Harness::with_store(
        MemoryCatalog::new(vec![make_item("p-1", 400)]),
        MockMetricsSource::new(),
        Arc::new(FailingPuts::new(Table::Analyses, allowed_puts)),
    )
}

#[tokio::test]
async fn unwritable_analysis_record_leaves_item_status_untouched() {
    let h = harness_with_failing_analyses(0);
    let generator = h.generator(vec![Ok(generation(FINDINGS, 1, 1))]);

    let err = pipeline(&h, Arc::clone(&generator)).analyze("p-1").await.unwrap_err();
    assert!(matches!(err, GolemError::Store(_)));
    let status = h
        .records
        .tracked_item("p-1")
        .unwrap()
        .map(|row| row.analysis_status)
        .unwrap_or_default();
    assert_ne!(status, AnalysisStatus::Analyzing);
    assert_eq!(generator.call_count(), 0);
    assert!(!h.leases().is_live(&analysis_key("p-1")).unwrap());
}

#[tokio::test]
async fn unwritable_analysis_outcome_moves_item_to_error() {
    let h = harness_with_failing_analyses(1);
    let generator = h.generator(vec![Ok(generation(FINDINGS, 1, 1))]);

    let err = pipeline(&h, Arc::clone(&generator)).analyze("p-1").await.unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert_eq!(generator.call_count(), 1);

    let row = h.records.tracked_item("p-1").unwrap().unwrap();
    assert_eq!(row.analysis_status, AnalysisStatus::Error);
    let record = h.records.analysis("p-1").unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Error);
    assert!(!h.leases().is_live(&analysis_key("p-1")).unwrap());
}
