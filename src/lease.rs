use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{Store, Table};
use crate::types::LeaseRecord;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique per acquisition across processes sharing a store.
fn new_token() -> String {
    let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{:x}-{}", std::process::id(), nanos, seq)
}

pub fn analysis_key(item_id: &str) -> String {
    format!("analyze:{}", item_id)
}

pub fn draft_key(item_id: &str) -> String {
    format!("draft:{}", item_id)
}

/// Acquisition parameters for one lease key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20 * 60),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome of one compare-and-swap attempt against the lease row.
enum Attempt {
    Acquired { reclaimed: bool },
    Held,
}

/// Keyed mutual exclusion backed by TTL entries in the shared store.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Try to take the lease for `key`.
    ///
    /// Each attempt is a single atomic write that succeeds when the key is
    /// free or its holder's lease has outlived its TTL. Reclaiming a stale
    /// lease never consumes an attempt. Returns `Ok(None)` once
    /// `max_attempts` live-holder attempts are exhausted; callers surface
    /// that as "already in progress".
    pub async fn acquire(
        &self,
        key: &str,
        opts: &LeaseOptions,
    ) -> Result<Option<LeaseGuard>, StoreError> {
        let token = new_token();
        let attempts = opts.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_claim(key, &token, opts.ttl)? {
                Attempt::Acquired { reclaimed } => {
                    if reclaimed {
                        warn!(key, "Reclaimed stale lease");
                    } else {
                        debug!(key, attempt, "Lease acquired");
                    }
                    return Ok(Some(LeaseGuard {
                        store: Arc::clone(&self.store),
                        key: key.to_string(),
                        token,
                        released: false,
                    }));
                }
                Attempt::Held => {
                    debug!(key, attempt, "Lease held elsewhere");
                    if attempt < attempts {
                        tokio::time::sleep(opts.backoff).await;
                    }
                }
            }
        }

        Ok(None)
    }

    fn try_claim(&self, key: &str, token: &str, ttl: Duration) -> Result<Attempt, StoreError> {
        let now = Utc::now();
        let record = LeaseRecord {
            key: key.to_string(),
            token: token.to_string(),
            issued_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let ours = serde_json::to_value(&record).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let mut reclaimed = false;
        let stored = self.store.update(Table::Leases, key, Some(ttl), &mut |current| {
            match current.map(|v| serde_json::from_value::<LeaseRecord>(v.clone())) {
                None => Some(ours.clone()),
                Some(Ok(held)) if held.is_stale(now) => {
                    reclaimed = true;
                    Some(ours.clone())
                }
                Some(Ok(_)) => None,
                // Unreadable rows cannot be proven live.
                Some(Err(_)) => {
                    reclaimed = true;
                    Some(ours.clone())
                }
            }
        })?;

        let won = stored
            .and_then(|v| v.get("token").and_then(|t| t.as_str()).map(|t| t == token))
            .unwrap_or(false);
        Ok(if won {
            Attempt::Acquired { reclaimed }
        } else {
            Attempt::Held
        })
    }

    /// Idempotent delete of whatever lease exists for `key`.
    pub fn release(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(Table::Leases, key)?;
        Ok(())
    }

    /// The current holder's record, if any (stale records included).
    pub fn holder(&self, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let Some(value) = self.store.get(Table::Leases, key)? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// True while a non-stale lease exists for `key`.
    pub fn is_live(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .holder(key)?
            .is_some_and(|record| !record.is_stale(Utc::now())))
    }
}

/// A held lease. Released on drop.
#[must_use = "lease is released when LeaseGuard is dropped"]
pub struct LeaseGuard {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now. Only deletes the row if it still carries this guard's
    /// token, so a lease reclaimed by another holder is left alone.
    /// Returns whether a row was deleted.
    pub fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        self.remove_own()
    }

    fn remove_own(&self) -> Result<bool, StoreError> {
        let token = self.token.as_str();
        self.store.remove_if(Table::Leases, &self.key, &|value| {
            value.get("token").and_then(|t| t.as_str()) == Some(token)
        })
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_own() {
            warn!(key = %self.key, "Failed to release lease: {}", e);
        }
    }
}
