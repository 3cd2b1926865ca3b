//! Durable task queue with an at-least-once claim lifecycle.
//!
//! A task is enqueued under a caller-chosen key, claimed by one worker for a
//! visibility window, then acked (deleted) or retried. A claim whose window
//! lapses makes the task claimable again, so a task whose worker died is
//! redelivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Store, Table};

/// A task to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Deterministic identity; enqueueing an existing key is a no-op.
    pub key: String,
    /// Handler name the worker dispatches on.
    pub name: String,
    /// Cancellation group. Keys in a group should share the group as prefix.
    pub group: String,
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub key: String,
    pub name: String,
    pub group: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    /// Deliveries so far, including the current one.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    /// Held by a worker whose visibility window has not lapsed.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim_token.is_some() && self.claim_expires_at.is_some_and(|at| at > now)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now && !self.is_claimed(now)
    }
}

/// Queue operations. Every call is independent and safe across processes
/// sharing the same backend.
pub trait TaskQueue: Send + Sync {
    /// Returns false when a task with the same key is already queued.
    fn enqueue(&self, task: NewTask) -> Result<bool, String>;

    /// Claim the oldest available task for `visibility`.
    fn dequeue(&self, visibility: Duration) -> Result<Option<Task>, String>;

    /// Finish a claimed task. Returns false if the claim was lost.
    fn ack(&self, task: &Task) -> Result<bool, String>;

    /// Release a claimed task for redelivery after `delay`.
    fn retry(&self, task: &Task, delay: Duration, error: &str) -> Result<bool, String>;

    /// Remove every task in `group` that no worker currently holds.
    fn cancel_group(&self, group: &str) -> Result<usize, String>;

    /// Queued tasks, optionally restricted to one group.
    fn pending(&self, group: Option<&str>) -> Result<usize, String>;
}

static CLAIM_COUNTER: AtomicU64 = AtomicU64::new(0);

fn claim_token() -> String {
    let seq = CLAIM_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("claim-{}-{:x}-{}", std::process::id(), nanos, seq)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// [`TaskQueue`] persisted in the `tasks` table of a [`Store`].
#[derive(Clone)]
pub struct StoreTaskQueue {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for StoreTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTaskQueue").finish_non_exhaustive()
    }
}

impl StoreTaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn tasks(&self, prefix: &str) -> Result<Vec<Task>, String> {
        let rows = self.store.scan(Table::Tasks, prefix)?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value::<Task>(value).ok())
            .collect())
    }

    /// Rewrite a task only while `token` still holds its claim.
    fn update_claimed(
        &self,
        task: &Task,
        change: impl Fn(&mut Task),
    ) -> Result<bool, String> {
        let Some(token) = task.claim_token.as_deref() else {
            return Ok(false);
        };
        let mut applied = false;
        self.store.update(Table::Tasks, &task.key, None, &mut |current| {
            let mut stored: Task = serde_json::from_value(current?.clone()).ok()?;
            if stored.claim_token.as_deref() != Some(token) {
                return None;
            }
            change(&mut stored);
            applied = true;
            serde_json::to_value(&stored).ok()
        })?;
        Ok(applied)
    }
}

impl TaskQueue for StoreTaskQueue {
    fn enqueue(&self, task: NewTask) -> Result<bool, String> {
        let now = Utc::now();
        let row = Task {
            key: task.key.clone(),
            name: task.name,
            group: task.group,
            payload: task.payload,
            enqueued_at: now,
            available_at: now,
            attempts: 0,
            claim_token: None,
            claim_expires_at: None,
            last_error: None,
        };
        let value = serde_json::to_value(&row).map_err(|e| e.to_string())?;
        Ok(self
            .store
            .insert_if_absent(Table::Tasks, &task.key, value, None)?)
    }

    fn dequeue(&self, visibility: Duration) -> Result<Option<Task>, String> {
        let now = Utc::now();
        let mut candidates: Vec<Task> = self
            .tasks("")?
            .into_iter()
            .filter(|t| t.is_claimable(now))
            .collect();
        candidates.sort_by(|a, b| {
            (a.available_at, a.enqueued_at, &a.key).cmp(&(b.available_at, b.enqueued_at, &b.key))
        });

        let token = claim_token();
        for candidate in candidates {
            let mut claimed: Option<Task> = None;
            self.store
                .update(Table::Tasks, &candidate.key, None, &mut |current| {
                    let mut task: Task = serde_json::from_value(current?.clone()).ok()?;
                    let now = Utc::now();
                    if !task.is_claimable(now) {
                        return None;
                    }
                    task.attempts += 1;
                    task.claim_token = Some(token.clone());
                    task.claim_expires_at = Some(after(now, visibility));
                    let value = serde_json::to_value(&task).ok()?;
                    claimed = Some(task);
                    Some(value)
                })?;
            if claimed.is_some() {
                return Ok(claimed);
            }
        }
        Ok(None)
    }

    fn ack(&self, task: &Task) -> Result<bool, String> {
        let Some(token) = task.claim_token.as_deref() else {
            return Ok(false);
        };
        Ok(self.store.remove_if(Table::Tasks, &task.key, &|value| {
            value.get("claim_token").and_then(|t| t.as_str()) == Some(token)
        })?)
    }

    fn retry(&self, task: &Task, delay: Duration, error: &str) -> Result<bool, String> {
        let available_at = after(Utc::now(), delay);
        self.update_claimed(task, |stored| {
            stored.claim_token = None;
            stored.claim_expires_at = None;
            stored.available_at = available_at;
            stored.last_error = Some(error.to_string());
        })
    }

    fn cancel_group(&self, group: &str) -> Result<usize, String> {
        let mut removed = 0;
        for task in self.tasks(group)? {
            if task.group != group {
                continue;
            }
            let gone = self.store.remove_if(Table::Tasks, &task.key, &|value| {
                serde_json::from_value::<Task>(value.clone())
                    .map_or(true, |t| !t.is_claimed(Utc::now()))
            })?;
            if gone {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn pending(&self, group: Option<&str>) -> Result<usize, String> {
        let tasks = self.tasks(group.unwrap_or(""))?;
        Ok(tasks
            .iter()
            .filter(|t| group.map_or(true, |g| t.group == g))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(now: DateTime<Utc>) -> Task {
        Task {
            key: "k".to_string(),
            name: "n".to_string(),
            group: "g".to_string(),
            payload: Value::Null,
            enqueued_at: now,
            available_at: now,
            attempts: 0,
            claim_token: None,
            claim_expires_at: None,
            last_error: None,
        }
    }

    #[test]
    fn lapsed_claim_is_claimable_again() {
        let now = Utc::now();
        let mut t = task(now);
        t.claim_token = Some("c".to_string());
        t.claim_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!t.is_claimable(now));
        assert!(t.is_claimable(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn delayed_task_is_not_claimable_early() {
        let now = Utc::now();
        let mut t = task(now);
        t.available_at = now + chrono::Duration::seconds(5);
        assert!(!t.is_claimable(now));
    }
}
