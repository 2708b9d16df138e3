use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runledger_common::{MigrationMetadata, Result};

use crate::record::MigrationRecord;

/// Durable store for migration records shared by every cooperating process.
///
/// Status transitions go through [`RecordStore::claim`] and the `mark_*`
/// releases only. `claim` must be a single atomic conditional update: it is
/// the only synchronization between processes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the backing table and indexes if they do not exist yet.
    async fn ensure_collection(&self) -> Result<()>;

    async fn find_by_key(&self, key: &str) -> Result<Option<MigrationRecord>>;

    /// Insert a `pending` record. Returns `false` when the key already exists.
    async fn create(&self, metadata: &MigrationMetadata) -> Result<bool>;

    /// Overwrite the descriptor-owned fields, leaving the ledger untouched.
    async fn update_metadata(&self, metadata: &MigrationMetadata) -> Result<()>;

    /// Atomically move an eligible record to `running`, clearing `error`.
    /// Returns `false` when another claimant won or the record is ineligible.
    async fn claim(&self, key: &str, claimant: &str) -> Result<bool>;

    /// `running -> applied`.
    async fn mark_applied(&self, key: &str, finished_at: DateTime<Utc>) -> Result<bool>;

    /// `running -> pending` with `run_count + 1`.
    async fn mark_recurring_success(&self, key: &str, finished_at: DateTime<Utc>)
    -> Result<bool>;

    /// `running -> failed`, storing `error`.
    async fn mark_failed(&self, key: &str, error: &str) -> Result<bool>;

    /// Records the driver should consider on a pass, ordered by `order`
    /// then registration sequence.
    async fn query_eligible(&self) -> Result<Vec<MigrationRecord>>;

    async fn list_records(&self) -> Result<Vec<MigrationRecord>>;

    /// Operator reconcile: `running | failed -> pending`.
    async fn reset(&self, key: &str) -> Result<bool>;
}
