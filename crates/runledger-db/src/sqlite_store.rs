use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use runledger_common::{Error, MigrationMetadata, MigrationSchedule, MigrationStatus, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params_from_iter};
use tracing::{debug, info};

use crate::record::MigrationRecord;
use crate::record_store::RecordStore;

pub const DEFAULT_COLLECTION: &str = "migrations";

const COLUMNS: &str = "seq, key, service_name, method_name, status, run_order, description, \
     run_once, retry_on_fail, run_on_init, schedule, last_run_at, error, run_count, \
     claimed_by, claimed_at, created_at, updated_at";

/// Statuses a claim may start from. `MigrationRecord::is_claimable` is the
/// in-memory form of the same predicate.
const CLAIMABLE: &str = "(status = 'pending' \
     OR (status = 'failed' AND retry_on_fail = 1) \
     OR (run_once = 0 AND status <> 'running'))";

/// Migration ledger backed by a SQLite table. Several processes may open the
/// same database file; claims are single conditional `UPDATE`s.
///
/// rusqlite is synchronous and a write can wait up to the busy timeout for
/// another process, so every call runs on tokio's blocking pool.
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteRecordStore {
    pub fn open(db_path: &Path, collection: &str, busy_timeout: Duration) -> Result<Self> {
        validate_collection_name(collection)?;
        info!(
            "opening migration ledger at {} (table {collection})",
            db_path.display()
        );
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: collection.to_string(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_collection(DEFAULT_COLLECTION)
    }

    pub fn in_memory_with_collection(collection: &str) -> Result<Self> {
        validate_collection_name(collection)?;
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: collection.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.table
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Database("migration ledger lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Database(format!("migration ledger task failed: {e}")))?
    }

    /// Run one write inside an immediate transaction so the write lock is
    /// taken (and waited for) before the row is read.
    async fn execute(
        &self,
        sql: String,
        params: Vec<Value>,
        action: &'static str,
    ) -> Result<usize> {
        self.with_connection(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| Error::Database(format!("failed to begin write: {e}")))?;
            let changed = tx
                .execute(&sql, params_from_iter(params))
                .map_err(|e| Error::Database(format!("failed to {action}: {e}")))?;
            tx.commit()
                .map_err(|e| Error::Database(format!("failed to commit {action}: {e}")))?;
            Ok(changed)
        })
        .await
    }

    async fn query_records(&self, sql: String) -> Result<Vec<MigrationRecord>> {
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

            let rows = stmt
                .query_map([], read_row)
                .map_err(|e| Error::Database(format!("failed to query migrations: {e}")))?;

            let mut records = Vec::new();
            for row in rows {
                let raw = row
                    .map_err(|e| Error::Database(format!("failed to read migration row: {e}")))?;
                records.push(raw.into_record()?);
            }
            Ok(records)
        })
        .await
    }
}

/// Descriptor-owned columns in the order `create` and `update_metadata` bind
/// them (`?2` to `?9`), after the key.
fn metadata_values(metadata: &MigrationMetadata) -> Result<Vec<Value>> {
    Ok(vec![
        Value::from(metadata.key.clone()),
        Value::from(metadata.service_name.clone()),
        Value::from(metadata.method_name.clone()),
        Value::from(metadata.order),
        Value::from(metadata.description.clone()),
        Value::from(metadata.run_once),
        Value::from(metadata.retry_on_fail),
        Value::from(metadata.run_on_init),
        Value::from(encode_schedule(metadata.schedule.as_ref())?),
    ])
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn ensure_collection(&self) -> Result<()> {
        let table = self.table.clone();
        self.with_connection(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| Error::Database(format!("failed to begin schema setup: {e}")))?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL UNIQUE,
                    service_name TEXT NOT NULL,
                    method_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    run_order INTEGER NOT NULL DEFAULT 0,
                    description TEXT,
                    run_once INTEGER NOT NULL DEFAULT 1,
                    retry_on_fail INTEGER NOT NULL DEFAULT 1,
                    run_on_init INTEGER NOT NULL DEFAULT 1,
                    schedule TEXT,
                    last_run_at TEXT,
                    error TEXT,
                    run_count INTEGER NOT NULL DEFAULT 0,
                    claimed_by TEXT,
                    claimed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_eligible
                    ON {table}(run_on_init, status, run_order, seq);"
            ))
            .map_err(|e| Error::Database(format!("failed to create {table} table: {e}")))?;
            tx.commit()
                .map_err(|e| Error::Database(format!("failed to commit schema setup: {e}")))?;

            debug!("migration table {table} ready");
            Ok(())
        })
        .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<MigrationRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE key = ?1", self.table);
        let key = key.to_string();
        self.with_connection(move |conn| {
            let raw = conn
                .query_row(&sql, [&key], read_row)
                .optional()
                .map_err(|e| Error::Database(format!("failed to load migration {key}: {e}")))?;
            raw.map(RawRecord::into_record).transpose()
        })
        .await
    }

    async fn create(&self, metadata: &MigrationMetadata) -> Result<bool> {
        let mut values = metadata_values(metadata)?;
        values.push(Value::from(format_datetime(Utc::now())));
        let inserted = self
            .execute(
                format!(
                    "INSERT INTO {} (key, service_name, method_name, status, run_order, description,
                         run_once, retry_on_fail, run_on_init, schedule, run_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)
                     ON CONFLICT(key) DO NOTHING",
                    self.table
                ),
                values,
                "create migration record",
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn update_metadata(&self, metadata: &MigrationMetadata) -> Result<()> {
        let mut values = metadata_values(metadata)?;
        values.push(Value::from(format_datetime(Utc::now())));
        let updated = self
            .execute(
                format!(
                    "UPDATE {} SET service_name = ?2, method_name = ?3, run_order = ?4,
                         description = ?5, run_once = ?6, retry_on_fail = ?7, run_on_init = ?8,
                         schedule = ?9, updated_at = ?10
                     WHERE key = ?1",
                    self.table
                ),
                values,
                "update migration metadata",
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("migration {}", metadata.key)));
        }
        Ok(())
    }

    async fn claim(&self, key: &str, claimant: &str) -> Result<bool> {
        let claimed = self
            .execute(
                format!(
                    "UPDATE {} SET status = 'running', error = NULL, claimed_by = ?2,
                         claimed_at = ?3, updated_at = ?3
                     WHERE key = ?1 AND {CLAIMABLE}",
                    self.table
                ),
                vec![
                    Value::from(key.to_string()),
                    Value::from(claimant.to_string()),
                    Value::from(format_datetime(Utc::now())),
                ],
                "claim migration",
            )
            .await?;
        Ok(claimed == 1)
    }

    async fn mark_applied(&self, key: &str, finished_at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .execute(
                format!(
                    "UPDATE {} SET status = 'applied', last_run_at = ?2, error = NULL, updated_at = ?2
                     WHERE key = ?1 AND status = 'running'",
                    self.table
                ),
                vec![
                    Value::from(key.to_string()),
                    Value::from(format_datetime(finished_at)),
                ],
                "mark migration applied",
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_recurring_success(
        &self,
        key: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self
            .execute(
                format!(
                    "UPDATE {} SET status = 'pending', last_run_at = ?2, error = NULL,
                         run_count = run_count + 1, updated_at = ?2
                     WHERE key = ?1 AND status = 'running'",
                    self.table
                ),
                vec![
                    Value::from(key.to_string()),
                    Value::from(format_datetime(finished_at)),
                ],
                "record recurring run",
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_failed(&self, key: &str, error: &str) -> Result<bool> {
        let updated = self
            .execute(
                format!(
                    "UPDATE {} SET status = 'failed', error = ?2, updated_at = ?3
                     WHERE key = ?1 AND status = 'running'",
                    self.table
                ),
                vec![
                    Value::from(key.to_string()),
                    Value::from(error.to_string()),
                    Value::from(format_datetime(Utc::now())),
                ],
                "mark migration failed",
            )
            .await?;
        Ok(updated == 1)
    }

    async fn query_eligible(&self) -> Result<Vec<MigrationRecord>> {
        self.query_records(format!(
            "SELECT {COLUMNS} FROM {}
             WHERE run_on_init = 1
               AND (status = 'pending'
                    OR (status = 'failed' AND retry_on_fail = 1)
                    OR run_once = 0)
             ORDER BY run_order ASC, seq ASC",
            self.table
        ))
        .await
    }

    async fn list_records(&self) -> Result<Vec<MigrationRecord>> {
        self.query_records(format!(
            "SELECT {COLUMNS} FROM {} ORDER BY run_order ASC, seq ASC",
            self.table
        ))
        .await
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let updated = self
            .execute(
                format!(
                    "UPDATE {} SET status = 'pending', error = NULL, claimed_by = NULL,
                         claimed_at = NULL, updated_at = ?2
                     WHERE key = ?1 AND status IN ('running', 'failed')",
                    self.table
                ),
                vec![
                    Value::from(key.to_string()),
                    Value::from(format_datetime(Utc::now())),
                ],
                "reset migration",
            )
            .await?;
        Ok(updated == 1)
    }
}

/// Column values as SQLite hands them back, before status/schedule/timestamp
/// decoding.
struct RawRecord {
    seq: i64,
    key: String,
    service_name: String,
    method_name: String,
    status: String,
    order: i64,
    description: Option<String>,
    run_once: bool,
    retry_on_fail: bool,
    run_on_init: bool,
    schedule: Option<String>,
    last_run_at: Option<String>,
    error: Option<String>,
    run_count: i64,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        seq: row.get(0)?,
        key: row.get(1)?,
        service_name: row.get(2)?,
        method_name: row.get(3)?,
        status: row.get(4)?,
        order: row.get(5)?,
        description: row.get(6)?,
        run_once: row.get(7)?,
        retry_on_fail: row.get(8)?,
        run_on_init: row.get(9)?,
        schedule: row.get(10)?,
        last_run_at: row.get(11)?,
        error: row.get(12)?,
        run_count: row.get(13)?,
        claimed_by: row.get(14)?,
        claimed_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<MigrationRecord> {
        let status: MigrationStatus = self.status.parse()?;
        let schedule = self
            .schedule
            .map(|raw| serde_json::from_str::<MigrationSchedule>(&raw))
            .transpose()?;

        Ok(MigrationRecord {
            seq: self.seq,
            key: self.key,
            service_name: self.service_name,
            method_name: self.method_name,
            status,
            order: self.order,
            description: self.description,
            run_once: self.run_once,
            retry_on_fail: self.retry_on_fail,
            run_on_init: self.run_on_init,
            schedule,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            run_count: self.run_count,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn encode_schedule(schedule: Option<&MigrationSchedule>) -> Result<Option<String>> {
    Ok(schedule
        .filter(|s| !s.is_empty())
        .map(serde_json::to_string)
        .transpose()?)
}

/// Collection names are interpolated into SQL, so only plain identifiers
/// are accepted.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("collection name cannot be empty".into()));
    }
    if name.len() > 64 {
        return Err(Error::Config("collection name too long".into()));
    }
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "invalid collection name {name:?}: use letters, digits and underscores"
        )));
    }
    Ok(())
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Rows written by hand through sqlite3 use datetime('now').
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Database(format!("invalid timestamp {s:?} in migration ledger: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn metadata(key: &str, order: i64) -> MigrationMetadata {
        MigrationMetadata {
            key: key.to_string(),
            service_name: "Backfills".to_string(),
            method_name: key.to_string(),
            order,
            description: None,
            run_once: true,
            retry_on_fail: true,
            run_on_init: true,
            schedule: None,
        }
    }

    async fn store_with(records: &[MigrationMetadata]) -> SqliteRecordStore {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.ensure_collection().await.unwrap();
        for meta in records {
            assert!(store.create(meta).await.unwrap());
        }
        store
    }

    #[tokio::test]
    async fn create_and_find_round_trip() {
        let mut meta = metadata("users.backfill", 3);
        meta.description = Some("fill display names".into());
        meta.schedule = Some(MigrationSchedule::cron("0 3 * * *").with_timezone("UTC"));
        let store = store_with(&[meta.clone()]).await;

        let record = store.find_by_key("users.backfill").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Pending);
        assert_eq!(record.metadata(), meta);
        assert_eq!(record.run_count, 0);
        assert!(record.last_run_at.is_none());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn find_missing_key_returns_none() {
        let store = store_with(&[]).await;
        assert!(store.find_by_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_existing_key_is_a_no_op() {
        let store = store_with(&[metadata("a", 1)]).await;
        assert!(!store.create(&metadata("a", 99)).await.unwrap());
        assert_eq!(store.find_by_key("a").await.unwrap().unwrap().order, 1);
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_metadata_keeps_ledger_fields() {
        let store = store_with(&[metadata("a", 1)]).await;
        assert!(store.claim("a", "w1").await.unwrap());
        assert!(store.mark_failed("a", "boom").await.unwrap());

        let mut meta = metadata("a", 7);
        meta.retry_on_fail = false;
        meta.description = Some("now documented".into());
        store.update_metadata(&meta).await.unwrap();

        let record = store.find_by_key("a").await.unwrap().unwrap();
        assert_eq!(record.order, 7);
        assert!(!record.retry_on_fail);
        assert_eq!(record.description.as_deref(), Some("now documented"));
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn update_metadata_for_missing_key_is_not_found() {
        let store = store_with(&[]).await;
        let err = store.update_metadata(&metadata("ghost", 0)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = store_with(&[metadata("a", 0)]).await;
        assert!(store.claim("a", "w1").await.unwrap());
        assert!(!store.claim("a", "w2").await.unwrap());

        let record = store.find_by_key("a").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Running);
        assert_eq!(record.claimed_by.as_deref(), Some("w1"));
        assert!(record.claimed_at.is_some());
    }

    #[tokio::test]
    async fn claim_respects_retry_flag_after_failure() {
        let mut no_retry = metadata("strict", 0);
        no_retry.retry_on_fail = false;
        let store = store_with(&[metadata("lenient", 0), no_retry]).await;

        for key in ["lenient", "strict"] {
            assert!(store.claim(key, "w1").await.unwrap());
            assert!(store.mark_failed(key, "boom").await.unwrap());
        }

        assert!(store.claim("lenient", "w1").await.unwrap());
        let record = store.find_by_key("lenient").await.unwrap().unwrap();
        assert!(record.error.is_none(), "claim clears the previous error");

        assert!(!store.claim("strict", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn applied_one_shot_is_never_claimed_again() {
        let store = store_with(&[metadata("a", 0)]).await;
        assert!(store.claim("a", "w1").await.unwrap());
        assert!(store.mark_applied("a", Utc::now()).await.unwrap());
        assert!(!store.claim("a", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn recurring_success_returns_to_pending_and_counts() {
        let mut meta = metadata("cleanup", 0);
        meta.run_once = false;
        let store = store_with(&[meta]).await;

        for expected in 1..=2 {
            assert!(store.claim("cleanup", "w1").await.unwrap());
            assert!(store.mark_recurring_success("cleanup", Utc::now()).await.unwrap());
            let record = store.find_by_key("cleanup").await.unwrap().unwrap();
            assert_eq!(record.status, MigrationStatus::Pending);
            assert_eq!(record.run_count, expected);
            assert!(record.last_run_at.is_some());
        }
    }

    #[tokio::test]
    async fn recurring_unit_is_claimable_after_failure_without_retry() {
        let mut meta = metadata("cleanup", 0);
        meta.run_once = false;
        meta.retry_on_fail = false;
        let store = store_with(&[meta]).await;

        assert!(store.claim("cleanup", "w1").await.unwrap());
        assert!(store.mark_failed("cleanup", "disk full").await.unwrap());
        assert!(store.claim("cleanup", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn releases_require_a_running_record() {
        let store = store_with(&[metadata("a", 0)]).await;
        assert!(!store.mark_applied("a", Utc::now()).await.unwrap());
        assert!(!store.mark_failed("a", "x").await.unwrap());
        assert!(!store.mark_recurring_success("a", Utc::now()).await.unwrap());
        assert_eq!(
            store.find_by_key("a").await.unwrap().unwrap().status,
            MigrationStatus::Pending
        );
    }

    #[tokio::test]
    async fn query_eligible_filters_and_orders() {
        let mut manual = metadata("manual", 0);
        manual.run_on_init = false;
        let mut recurring = metadata("recurring", 20);
        recurring.run_once = false;
        let mut strict = metadata("strict", 1);
        strict.retry_on_fail = false;

        let store = store_with(&[
            metadata("late", 10),
            metadata("tie-first", 5),
            metadata("tie-second", 5),
            manual,
            recurring,
            strict,
            metadata("done", 2),
        ])
        .await;

        assert!(store.claim("strict", "w1").await.unwrap());
        assert!(store.mark_failed("strict", "boom").await.unwrap());
        assert!(store.claim("done", "w1").await.unwrap());
        assert!(store.mark_applied("done", Utc::now()).await.unwrap());
        assert!(store.claim("recurring", "w1").await.unwrap());
        assert!(store.mark_recurring_success("recurring", Utc::now()).await.unwrap());

        let keys: Vec<String> = store
            .query_eligible()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["tie-first", "tie-second", "late", "recurring"]);
    }

    #[tokio::test]
    async fn record_predicates_agree_with_store_queries() {
        let mut metas = Vec::new();
        let mut cases = Vec::new();
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Running,
            MigrationStatus::Applied,
            MigrationStatus::Failed,
        ] {
            for run_once in [true, false] {
                for retry_on_fail in [true, false] {
                    for run_on_init in [true, false] {
                        let key = format!("{status}-{run_once}-{retry_on_fail}-{run_on_init}");
                        let mut meta = metadata(&key, 0);
                        meta.run_once = run_once;
                        meta.retry_on_fail = retry_on_fail;
                        meta.run_on_init = run_on_init;
                        metas.push(meta);
                        cases.push((key, status));
                    }
                }
            }
        }
        let store = store_with(&metas).await;

        for (key, status) in &cases {
            if *status != MigrationStatus::Pending {
                assert!(store.claim(key, "setup").await.unwrap());
            }
            match status {
                MigrationStatus::Applied => {
                    assert!(store.mark_applied(key, Utc::now()).await.unwrap())
                }
                MigrationStatus::Failed => assert!(store.mark_failed(key, "boom").await.unwrap()),
                _ => {}
            }
        }

        let eligible: HashSet<String> = store
            .query_eligible()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        for (key, status) in &cases {
            let record = store.find_by_key(key).await.unwrap().unwrap();
            assert_eq!(record.status, *status);
            assert_eq!(record.is_eligible(), eligible.contains(key), "eligibility of {key}");
            assert_eq!(
                record.is_claimable(),
                store.claim(key, "checker").await.unwrap(),
                "claim of {key}"
            );
        }
    }

    #[tokio::test]
    async fn reset_reconciles_stuck_and_failed_records() {
        let store = store_with(&[metadata("stuck", 0), metadata("done", 1)]).await;
        assert!(store.claim("stuck", "crashed-pod").await.unwrap());
        assert!(store.claim("done", "w1").await.unwrap());
        assert!(store.mark_applied("done", Utc::now()).await.unwrap());

        assert!(store.reset("stuck").await.unwrap());
        let record = store.find_by_key("stuck").await.unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Pending);
        assert!(record.claimed_by.is_none());

        assert!(!store.reset("done").await.unwrap());
        assert!(!store.reset("missing").await.unwrap());
    }

    #[test]
    fn collection_names_must_be_identifiers() {
        assert!(validate_collection_name("migrations").is_ok());
        assert!(validate_collection_name("_app_v2").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("2fast").is_err());
        assert!(validate_collection_name("migrations; DROP TABLE x").is_err());
        assert!(SqliteRecordStore::in_memory_with_collection("bad-name").is_err());
    }

    #[tokio::test]
    async fn custom_collection_is_used() {
        let store = SqliteRecordStore::in_memory_with_collection("app_jobs").unwrap();
        assert_eq!(store.collection(), "app_jobs");
        store.ensure_collection().await.unwrap();
        assert!(store.create(&metadata("a", 0)).await.unwrap());
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operations_before_ensure_collection_fail() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let err = store.find_by_key("a").await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[tokio::test]
    async fn unreadable_timestamps_are_reported() {
        let store = store_with(&[metadata("a", 0), metadata("b", 1)]).await;
        let table = store.collection().to_string();
        store
            .with_connection(move |conn| {
                conn.execute(
                    &format!("UPDATE {table} SET last_run_at = 'yesterday' WHERE key = 'a'"),
                    [],
                )
                .unwrap();
                conn.execute(
                    &format!(
                        "UPDATE {table} SET last_run_at = '2026-05-04 09:30:00' WHERE key = 'b'"
                    ),
                    [],
                )
                .unwrap();
                Ok(())
            })
            .await
            .unwrap();

        let err = store.find_by_key("a").await.unwrap_err();
        assert!(matches!(err, Error::Database(msg) if msg.contains("yesterday")));
        assert!(store.list_records().await.is_err());

        let record = store.find_by_key("b").await.unwrap().unwrap();
        assert_eq!(
            record.last_run_at.map(|t| t.to_rfc3339()),
            Some("2026-05-04T09:30:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn waiting_on_a_locked_ledger_does_not_block_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let store =
            SqliteRecordStore::open(&path, DEFAULT_COLLECTION, Duration::from_secs(5)).unwrap();
        store.ensure_collection().await.unwrap();
        assert!(store.create(&metadata("a", 0)).await.unwrap());

        // Another process holds the write lock for a while.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder_path = path.clone();
        let holder = std::thread::spawn(move || {
            let conn = Connection::open(holder_path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let ((claimed, claimed_at), ticked_at) = tokio::join!(
            async {
                let claimed = store.claim("a", "w1").await.unwrap();
                (claimed, Instant::now())
            },
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Instant::now()
            }
        );
        holder.join().unwrap();

        assert!(claimed);
        assert!(ticked_at < claimed_at, "timer stalled behind the blocked claim");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_across_connections_grant_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let timeout = Duration::from_secs(5);

        let setup = SqliteRecordStore::open(&path, DEFAULT_COLLECTION, timeout).unwrap();
        setup.ensure_collection().await.unwrap();
        assert!(setup.create(&metadata("shared", 0)).await.unwrap());

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = SqliteRecordStore::open(&path, DEFAULT_COLLECTION, timeout).unwrap();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.claim("shared", &format!("w{worker}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(
            setup.find_by_key("shared").await.unwrap().unwrap().status,
            MigrationStatus::Running
        );
    }
}
