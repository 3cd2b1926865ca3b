use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use refresh_golem::queue::{NewTask, StoreTaskQueue, TaskQueue};
use refresh_golem::store::{MemoryStore, Store};

fn queue() -> StoreTaskQueue {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    StoreTaskQueue::new(store)
}

fn task(key: &str, group: &str) -> NewTask {
    NewTask {
        key: key.to_string(),
        name: "test".to_string(),
        group: group.to_string(),
        payload: json!({"key": key}),
    }
}

const VISIBILITY: Duration = Duration::from_secs(60);

#[test]
fn enqueue_is_idempotent_per_key() {
    let q = queue();
    assert!(q.enqueue(task("g:1", "g")).unwrap());
    assert!(!q.enqueue(task("g:1", "g")).unwrap());
    assert_eq!(q.pending(None).unwrap(), 1);
}

#[test]
fn dequeue_claims_in_enqueue_order() {
    let q = queue();
    q.enqueue(task("g:1", "g")).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    q.enqueue(task("g:0", "g")).unwrap();

    let first = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert_eq!(first.key, "g:1");
    assert_eq!(first.attempts, 1);
    assert!(first.claim_token.is_some());

    let second = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert_eq!(second.key, "g:0");
    assert!(q.dequeue(VISIBILITY).unwrap().is_none(), "claimed tasks are invisible");
}

#[test]
fn ack_removes_task() {
    let q = queue();
    q.enqueue(task("g:1", "g")).unwrap();
    let claimed = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert!(q.ack(&claimed).unwrap());
    assert_eq!(q.pending(None).unwrap(), 0);
    assert!(!q.ack(&claimed).unwrap());
}

#[test]
fn lapsed_claim_is_redelivered() {
    let q = queue();
    q.enqueue(task("g:1", "g")).unwrap();
    let first = q.dequeue(Duration::from_millis(5)).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let second = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert_eq!(second.key, "g:1");
    assert_eq!(second.attempts, 2);
    assert!(!q.ack(&first).unwrap(), "stale claim cannot ack");
    assert!(q.ack(&second).unwrap());
}

#[test]
fn retry_delays_redelivery_and_records_error() {
    let q = queue();
    q.enqueue(task("g:1", "g")).unwrap();
    let claimed = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert!(q.retry(&claimed, Duration::from_secs(60), "boom").unwrap());

    assert!(q.dequeue(VISIBILITY).unwrap().is_none());
    assert_eq!(q.pending(None).unwrap(), 1);
}

#[test]
fn retry_without_delay_is_immediately_claimable() {
    let q = queue();
    q.enqueue(task("g:1", "g")).unwrap();
    let claimed = q.dequeue(VISIBILITY).unwrap().unwrap();
    q.retry(&claimed, Duration::ZERO, "boom").unwrap();

    let again = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert_eq!(again.attempts, 2);
    assert_eq!(again.last_error.as_deref(), Some("boom"));
}

#[test]
fn cancel_group_removes_only_unclaimed_tasks_in_group() {
    let q = queue();
    q.enqueue(task("job-a:1", "job-a")).unwrap();
    q.enqueue(task("job-a:2", "job-a")).unwrap();
    q.enqueue(task("job-ab:1", "job-ab")).unwrap();

    let in_flight = q.dequeue(VISIBILITY).unwrap().unwrap();
    assert_eq!(in_flight.key, "job-a:1");

    assert_eq!(q.cancel_group("job-a").unwrap(), 1);
    assert_eq!(q.pending(Some("job-a")).unwrap(), 1);
    assert_eq!(q.pending(Some("job-ab")).unwrap(), 1);
    assert!(q.ack(&in_flight).unwrap());
}
