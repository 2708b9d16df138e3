use std::sync::Arc;

use runledger_common::Result;
use runledger_db::RecordStore;
use tracing::{debug, info};

use crate::descriptor::MigrationDescriptor;

/// What a registration did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
}

/// Reconciles descriptors with stored records: creates missing records as
/// `pending` and refreshes metadata on existing ones. Never touches status,
/// `last_run_at`, `error` or `run_count`, so it is safe to run on every
/// process start while other processes are executing.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RecordStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, descriptor: &MigrationDescriptor) -> Result<Registration> {
        let metadata = descriptor.metadata();

        if self.store.find_by_key(&metadata.key).await?.is_none()
            && self.store.create(&metadata).await?
        {
            info!("registered new migration {}", metadata.key);
            return Ok(Registration::Created);
        }

        // Either the record existed or another process inserted it between
        // the lookup and our insert.
        self.store.update_metadata(&metadata).await?;
        debug!("refreshed metadata for migration {}", metadata.key);
        Ok(Registration::Updated)
    }
}
