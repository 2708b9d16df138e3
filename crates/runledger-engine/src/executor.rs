use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use runledger_common::{Error, Result};
use runledger_db::RecordStore;
use tracing::{debug, error, info, warn};

use crate::descriptor::MigrationDescriptor;

/// Result of one attempt to execute a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// One-shot run finished; the record is `applied`.
    Applied,
    /// Recurring run finished; the record is back to `pending`.
    Completed,
    /// Recurring run failed; the record is `failed` with this detail.
    Failed(String),
    /// The claim was lost to another process or the record is not eligible.
    Skipped,
}

/// Claims records and runs migration bodies against them.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn RecordStore>,
    claimant: String,
}

impl Executor {
    pub fn new(store: Arc<dyn RecordStore>, claimant: impl Into<String>) -> Self {
        Self {
            store,
            claimant: claimant.into(),
        }
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    /// One-shot path: claim, run, then `applied` or `failed`. A body failure
    /// is recorded and returned as [`Error::Migration`].
    pub async fn run_once(&self, descriptor: &MigrationDescriptor) -> Result<ExecutionOutcome> {
        let key = descriptor.key.as_str();
        if !self.claim(key).await? {
            return Ok(ExecutionOutcome::Skipped);
        }

        info!("running migration {key}");
        let started = Instant::now();
        match invoke_body(descriptor).await {
            Ok(()) => {
                if !self.store.mark_applied(key, Utc::now()).await? {
                    warn!("migration {key} finished but its record was no longer running");
                }
                info!(
                    "migration {key} applied in {}ms",
                    started.elapsed().as_millis()
                );
                Ok(ExecutionOutcome::Applied)
            }
            Err(message) => {
                self.record_failure(key, &message).await?;
                error!("migration {key} failed: {message}");
                Err(Error::Migration {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }

    /// Recurring path: claim, run, then back to `pending` with
    /// `run_count + 1`, or `failed`. Body failures are recorded and
    /// reported in the outcome, never returned as errors.
    pub async fn run_recurring(&self, descriptor: &MigrationDescriptor) -> Result<ExecutionOutcome> {
        let key = descriptor.key.as_str();
        if !self.claim(key).await? {
            return Ok(ExecutionOutcome::Skipped);
        }

        debug!("running recurring migration {key}");
        let started = Instant::now();
        match invoke_body(descriptor).await {
            Ok(()) => {
                if !self.store.mark_recurring_success(key, Utc::now()).await? {
                    warn!("recurring migration {key} finished but its record was no longer running");
                }
                info!(
                    "recurring migration {key} completed in {}ms",
                    started.elapsed().as_millis()
                );
                Ok(ExecutionOutcome::Completed)
            }
            Err(message) => {
                self.record_failure(key, &message).await?;
                error!("recurring migration {key} failed, will retry on next trigger: {message}");
                Ok(ExecutionOutcome::Failed(message))
            }
        }
    }

    async fn claim(&self, key: &str) -> Result<bool> {
        let claimed = self.store.claim(key, &self.claimant).await?;
        if !claimed {
            debug!("migration {key} not claimed (running elsewhere or not eligible), skipping");
        }
        Ok(claimed)
    }

    async fn record_failure(&self, key: &str, message: &str) -> Result<()> {
        if !self.store.mark_failed(key, message).await? {
            warn!("migration {key} failed but its record was no longer running");
        }
        Ok(())
    }
}

/// Run the body, turning errors and panics into a stored error detail.
async fn invoke_body(descriptor: &MigrationDescriptor) -> std::result::Result<(), String> {
    match AssertUnwindSafe(descriptor.body().invoke())
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
