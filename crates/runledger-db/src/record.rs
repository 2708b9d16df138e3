use chrono::{DateTime, Utc};
use runledger_common::{MigrationMetadata, MigrationSchedule, MigrationStatus};
use serde::{Deserialize, Serialize};

/// A persisted migration record: the descriptor's metadata projection plus
/// the execution ledger for that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Registration sequence; breaks ties between equal `order` values.
    pub seq: i64,
    pub key: String,
    pub service_name: String,
    pub method_name: String,
    pub status: MigrationStatus,
    pub order: i64,
    pub description: Option<String>,
    pub run_once: bool,
    pub retry_on_fail: bool,
    pub run_on_init: bool,
    pub schedule: Option<MigrationSchedule>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub run_count: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// Whether the driver's eligibility query would select this record.
    pub fn is_eligible(&self) -> bool {
        self.run_on_init
            && (self.status == MigrationStatus::Pending
                || (self.status == MigrationStatus::Failed && self.retry_on_fail)
                || !self.run_once)
    }

    /// Whether a claim against this record would currently succeed.
    pub fn is_claimable(&self) -> bool {
        match self.status {
            MigrationStatus::Pending => true,
            MigrationStatus::Failed => self.retry_on_fail || !self.run_once,
            MigrationStatus::Applied => !self.run_once,
            MigrationStatus::Running => false,
        }
    }

    pub fn metadata(&self) -> MigrationMetadata {
        MigrationMetadata {
            key: self.key.clone(),
            service_name: self.service_name.clone(),
            method_name: self.method_name.clone(),
            order: self.order,
            description: self.description.clone(),
            run_once: self.run_once,
            retry_on_fail: self.retry_on_fail,
            run_on_init: self.run_on_init,
            schedule: self.schedule.clone(),
        }
    }
}
