use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::error::StoreError;

/// Logical tables of the store. Each table is an independent keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Jobs,
    Items,
    Analyses,
    Drafts,
    Artifacts,
    Leases,
    Cache,
    Tasks,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Items => "items",
            Table::Analyses => "analyses",
            Table::Drafts => "drafts",
            Table::Artifacts => "artifacts",
            Table::Leases => "leases",
            Table::Cache => "cache",
            Table::Tasks => "tasks",
        }
    }
}

/// One stored value with an optional expiry. Expired entries read as absent.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(|ttl| expiry(ttl, now)),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn expiry(ttl: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Closure for [`Store::update`]. Receives the live value (if any); returning
/// `Some` writes the new value, `None` leaves the row untouched.
pub type UpdateFn<'a> = dyn FnMut(Option<&Value>) -> Option<Value> + 'a;

/// Key-value persistence with per-entry TTL.
///
/// Every method is atomic for the single row it touches. Nothing spans rows.
pub trait Store: Send + Sync {
    fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError>;

    fn put(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Create-if-absent. Returns false when a live entry already exists.
    fn insert_if_absent(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Idempotent delete. Returns whether a live entry was removed.
    fn remove(&self, table: Table, key: &str) -> Result<bool, StoreError>;

    /// Compare-and-delete: removes the entry only if `pred` accepts its value.
    fn remove_if(
        &self,
        table: Table,
        key: &str,
        pred: &dyn Fn(&Value) -> bool,
    ) -> Result<bool, StoreError>;

    /// Atomic read-modify-write. Returns the value stored after the call.
    ///
    /// When `ttl` is `None` a rewritten entry keeps its previous expiry.
    fn update(
        &self,
        table: Table,
        key: &str,
        ttl: Option<Duration>,
        apply: &mut UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError>;

    /// Live entries whose key starts with `prefix`, in key order.
    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

type TableData = BTreeMap<String, Entry>;

// --- Shared row operations ---

mod ops {
    use super::*;

    pub fn get(data: &TableData, key: &str, now: DateTime<Utc>) -> Option<Value> {
        data.get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    pub fn put(
        data: &mut TableData,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        data.insert(key.to_string(), Entry::new(value, ttl, now));
    }

    pub fn insert_if_absent(
        data: &mut TableData,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        if data.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        data.insert(key.to_string(), Entry::new(value, ttl, now));
        true
    }

    pub fn remove(data: &mut TableData, key: &str, now: DateTime<Utc>) -> bool {
        data.remove(key).is_some_and(|e| e.is_live(now))
    }

    pub fn remove_if(
        data: &mut TableData,
        key: &str,
        pred: &dyn Fn(&Value) -> bool,
        now: DateTime<Utc>,
    ) -> bool {
        match data.get(key) {
            Some(e) if e.is_live(now) && pred(&e.value) => {
                data.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Returns (value after call, dirty).
    pub fn update(
        data: &mut TableData,
        key: &str,
        ttl: Option<Duration>,
        apply: &mut UpdateFn<'_>,
        now: DateTime<Utc>,
    ) -> (Option<Value>, bool) {
        let live = data.get(key).filter(|e| e.is_live(now));
        let previous_expiry = live.and_then(|e| e.expires_at);
        match apply(live.map(|e| &e.value)) {
            Some(value) => {
                let expires_at = match ttl {
                    Some(ttl) => expiry(ttl, now),
                    None => previous_expiry,
                };
                data.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        expires_at,
                    },
                );
                (Some(value), true)
            }
            None => (live.map(|e| e.value.clone()), false),
        }
    }

    pub fn scan(data: &TableData, prefix: &str, now: DateTime<Utc>) -> Vec<(String, Value)> {
        data.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Drops expired entries. Returns whether anything was removed.
    pub fn purge(data: &mut TableData, now: DateTime<Utc>) -> bool {
        let before = data.len();
        data.retain(|_, e| e.is_live(now));
        data.len() != before
    }
}

// --- In-memory store ---

/// Process-local store for tests and single-process use.
///
/// Uses `std::sync::Mutex` (not tokio's) because every operation is a short
/// map mutation with no I/O under the lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, TableData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(
        &self,
        table: Table,
        f: impl FnOnce(&mut TableData, DateTime<Utc>) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let data = tables.entry(table).or_default();
        Ok(f(data, Utc::now()))
    }

    /// Like `with_table`, but drops expired entries before mutating.
    fn write_table<R>(
        &self,
        table: Table,
        f: impl FnOnce(&mut TableData, DateTime<Utc>) -> R,
    ) -> Result<R, StoreError> {
        self.with_table(table, |data, now| {
            ops::purge(data, now);
            f(data, now)
        })
    }
}

impl Store for MemoryStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_table(table, |data, now| ops::get(data, key, now))
    }

    fn put(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.write_table(table, |data, now| ops::put(data, key, value, ttl, now))
    }

    fn insert_if_absent(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.write_table(table, |data, now| {
            ops::insert_if_absent(data, key, value, ttl, now)
        })
    }

    fn remove(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.write_table(table, |data, now| ops::remove(data, key, now))
    }

    fn remove_if(
        &self,
        table: Table,
        key: &str,
        pred: &dyn Fn(&Value) -> bool,
    ) -> Result<bool, StoreError> {
        self.write_table(table, |data, now| ops::remove_if(data, key, pred, now))
    }

    fn update(
        &self,
        table: Table,
        key: &str,
        ttl: Option<Duration>,
        apply: &mut UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError> {
        self.write_table(table, |data, now| ops::update(data, key, ttl, apply, now).0)
    }

    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.with_table(table, |data, now| ops::scan(data, prefix, now))
    }
}

// --- SQLite-backed store ---

const DB_FILE: &str = "store.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS entries (
      tbl TEXT NOT NULL,
      key TEXT NOT NULL,
      value TEXT NOT NULL,
      expires_at INTEGER,
      PRIMARY KEY (tbl, key)
    );

    CREATE INDEX IF NOT EXISTS entries_expiry ON entries (tbl, expires_at);
"#;

/// Durable store shared by every process pointed at the same directory.
///
/// One row per key in `store.db`, expiry kept as epoch milliseconds (NULL for
/// none). Writes run in `IMMEDIATE` transactions, so a read-modify-write holds
/// the database write lock from its read to its commit. Each write first
/// deletes the table's expired rows.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dir: PathBuf,
}

impl SqliteStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create {}: {}", dir.display(), e)))?;
        let conn = Connection::open(dir.join(DB_FILE)).map_err(sql_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&Connection, DateTime<Utc>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&*conn, Utc::now())
    }

    /// Run `f` in one write transaction after purging expired rows of `table`.
    fn write<R>(
        &self,
        table: Table,
        f: impl FnOnce(&Connection, DateTime<Utc>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        tx.execute(
            "DELETE FROM entries WHERE tbl = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![table.as_str(), now.timestamp_millis()],
        )
        .map_err(sql_error)?;
        let result = f(&*tx, now)?;
        tx.commit().map_err(sql_error)?;
        Ok(result)
    }
}

fn sql_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Lock(err.to_string())
        }
        _ => StoreError::Io(err.to_string()),
    }
}

fn expiry_millis(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<i64> {
    ttl.and_then(|ttl| expiry(ttl, now))
        .map(|at| at.timestamp_millis())
}

fn decode(key: &str, text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// The live row for `key`: its value and expiry in epoch milliseconds.
fn load_row(
    conn: &Connection,
    table: Table,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<(Value, Option<i64>)>, StoreError> {
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT value, expires_at FROM entries
             WHERE tbl = ?1 AND key = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
            params![table.as_str(), key, now.timestamp_millis()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(sql_error)?;
    row.map(|(text, expires_at)| Ok((decode(key, &text)?, expires_at)))
        .transpose()
}

fn store_row(
    conn: &Connection,
    table: Table,
    key: &str,
    value: &Value,
    expires_at: Option<i64>,
) -> Result<(), StoreError> {
    let text = serde_json::to_string(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    conn.execute(
        "INSERT OR REPLACE INTO entries (tbl, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![table.as_str(), key, text, expires_at],
    )
    .map_err(sql_error)?;
    Ok(())
}

fn delete_row(conn: &Connection, table: Table, key: &str) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            "DELETE FROM entries WHERE tbl = ?1 AND key = ?2",
            params![table.as_str(), key],
        )
        .map_err(sql_error)?;
    Ok(changed > 0)
}

impl Store for SqliteStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.read(|conn, now| Ok(load_row(conn, table, key, now)?.map(|(value, _)| value)))
    }

    fn put(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.write(table, |conn, now| {
            store_row(conn, table, key, &value, expiry_millis(ttl, now))
        })
    }

    fn insert_if_absent(
        &self,
        table: Table,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.write(table, |conn, now| {
            if load_row(conn, table, key, now)?.is_some() {
                return Ok(false);
            }
            store_row(conn, table, key, &value, expiry_millis(ttl, now))?;
            Ok(true)
        })
    }

    fn remove(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        // Expired rows are already gone once the write transaction starts.
        self.write(table, |conn, _| delete_row(conn, table, key))
    }

    fn remove_if(
        &self,
        table: Table,
        key: &str,
        pred: &dyn Fn(&Value) -> bool,
    ) -> Result<bool, StoreError> {
        self.write(table, |conn, now| match load_row(conn, table, key, now)? {
            Some((value, _)) if pred(&value) => delete_row(conn, table, key),
            _ => Ok(false),
        })
    }

    fn update(
        &self,
        table: Table,
        key: &str,
        ttl: Option<Duration>,
        apply: &mut UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError> {
        self.write(table, |conn, now| {
            let current = load_row(conn, table, key, now)?;
            match apply(current.as_ref().map(|(value, _)| value)) {
                Some(value) => {
                    let expires_at = match ttl {
                        Some(_) => expiry_millis(ttl, now),
                        None => current.and_then(|(_, at)| at),
                    };
                    store_row(conn, table, key, &value, expires_at)?;
                    Ok(Some(value))
                }
                None => Ok(current.map(|(value, _)| value)),
            }
        })
    }

    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.read(|conn, now| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, value FROM entries
                     WHERE tbl = ?1 AND key >= ?2 AND (expires_at IS NULL OR expires_at > ?3)
                     ORDER BY key",
                )
                .map_err(sql_error)?;
            let mut rows = stmt
                .query(params![table.as_str(), prefix, now.timestamp_millis()])
                .map_err(sql_error)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(sql_error)? {
                let key: String = row.get(0).map_err(sql_error)?;
                if !key.starts_with(prefix) {
                    break;
                }
                let text: String = row.get(1).map_err(sql_error)?;
                let value = decode(&key, &text)?;
                out.push((key, value));
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_read_as_absent() {
        let mut data = TableData::new();
        let now = Utc::now();
        data.insert(
            "k".to_string(),
            Entry {
                value: Value::from(1),
                expires_at: Some(now - chrono::Duration::seconds(1)),
            },
        );
        assert_eq!(ops::get(&data, "k", now), None);
        assert!(ops::insert_if_absent(&mut data, "k", Value::from(2), None, now));
        assert_eq!(ops::get(&data, "k", now), Some(Value::from(2)));
    }

    #[test]
    fn scan_respects_prefix_boundaries() {
        let mut data = TableData::new();
        let now = Utc::now();
        for key in ["a:1", "a:2", "ab:1", "b:1"] {
            ops::put(&mut data, key, Value::from(key), None, now);
        }
        let keys: Vec<String> = ops::scan(&data, "a:", now)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a:1".to_string(), "a:2".to_string()]);
    }

    #[test]
    fn update_without_ttl_keeps_previous_expiry() {
        let mut data = TableData::new();
        let now = Utc::now();
        ops::put(
            &mut data,
            "k",
            Value::from(1),
            Some(Duration::from_secs(60)),
            now,
        );
        let before = data["k"].expires_at;
        let (value, dirty) = ops::update(&mut data, "k", None, &mut |_| Some(Value::from(2)), now);
        assert!(dirty);
        assert_eq!(value, Some(Value::from(2)));
        assert_eq!(data["k"].expires_at, before);
    }

    #[test]
    fn memory_writes_drop_expired_entries() {
        let store = MemoryStore::new();
        store
            .put(Table::Cache, "old", Value::from(1), Some(Duration::from_millis(5)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.put(Table::Cache, "new", Value::from(2), None).unwrap();

        let tables = store.tables.lock().unwrap();
        let keys: Vec<&String> = tables[&Table::Cache].keys().collect();
        assert_eq!(keys, vec!["new"]);
    }

    fn sqlite_row_count(store: &SqliteStore, table: Table) -> i64 {
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entries WHERE tbl = ?1",
                params![table.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        count
    }

    #[test]
    fn sqlite_writes_delete_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        store
            .put(Table::Cache, "old", Value::from(1), Some(Duration::from_millis(5)))
            .unwrap();
        store.put(Table::Items, "other", Value::from(0), Some(Duration::from_millis(5))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sqlite_row_count(&store, Table::Cache), 1);

        store.put(Table::Cache, "new", Value::from(2), None).unwrap();
        assert_eq!(sqlite_row_count(&store, Table::Cache), 1);
        // Purging is per table.
        assert_eq!(sqlite_row_count(&store, Table::Items), 1);
    }

    #[test]
    fn sqlite_update_keeps_one_row_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        for i in 0..500 {
            store
                .put(Table::Items, &format!("item:{:04}", i), Value::from(i), None)
                .unwrap();
        }
        for _ in 0..3 {
            store
                .update(Table::Items, "item:0007", None, &mut |current| {
                    Some(Value::from(current?.as_i64()? + 1))
                })
                .unwrap();
        }
        assert_eq!(sqlite_row_count(&store, Table::Items), 500);
        assert_eq!(
            store.get(Table::Items, "item:0007").unwrap(),
            Some(Value::from(10))
        );
        assert_eq!(store.scan(Table::Items, "item:00").unwrap().len(), 100);
    }

    #[test]
    fn sqlite_update_without_ttl_keeps_previous_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        store
            .put(Table::Leases, "k", Value::from(1), Some(Duration::from_millis(50)))
            .unwrap();
        store
            .update(Table::Leases, "k", None, &mut |_| Some(Value::from(2)))
            .unwrap();
        assert_eq!(store.get(Table::Leases, "k").unwrap(), Some(Value::from(2)));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(store.get(Table::Leases, "k").unwrap(), None);
    }
}
