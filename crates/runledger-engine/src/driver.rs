use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use runledger_common::{Error, Result};
use runledger_config::{AppConfig, DatabaseConfig};
use runledger_db::{MigrationRecord, RecordStore, SqliteRecordStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::descriptor::{DescriptorSource, MigrationDescriptor};
use crate::executor::{ExecutionOutcome, Executor};
use crate::registry::Registry;
use crate::scheduler::{NoopScheduler, ScheduledJob, Scheduler, TokioScheduler};

/// What one driver pass did, by migration key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// One-shot migrations applied inline during the pass.
    pub applied: Vec<String>,
    /// Recurring migrations whose immediate run completed.
    pub recurring: Vec<String>,
    /// Recurring migrations whose immediate run failed (recorded, not raised).
    pub failed: Vec<String>,
    /// Migrations handed to the scheduler.
    pub scheduled: Vec<String>,
    /// Eligible records that were not executed on this pass.
    pub skipped: Vec<String>,
}

/// Open the configured ledger. Without a path the ledger lives in memory and
/// is private to this process.
pub fn open_record_store(config: &DatabaseConfig) -> Result<SqliteRecordStore> {
    match &config.path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            SqliteRecordStore::open(
                path,
                &config.collection,
                Duration::from_millis(config.busy_timeout_ms),
            )
        }
        None => {
            warn!("no database path configured, using an in-memory migration ledger");
            SqliteRecordStore::in_memory_with_collection(&config.collection)
        }
    }
}

/// Single entry point tying registry, executor and scheduler together.
///
/// Lifecycle: construct, then [`Orchestrator::bootstrap`] (or
/// [`Orchestrator::init`] / [`Orchestrator::init_and_maybe_run`] directly),
/// keep the value alive while scheduled work should fire, and call
/// [`Orchestrator::shutdown`] to revoke every pending schedule.
pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn DescriptorSource>,
    scheduler: Arc<dyn Scheduler>,
    registry: Registry,
    executor: Executor,
    descriptors: RwLock<HashMap<String, Arc<MigrationDescriptor>>>,
    instance_id: String,
    auto_run: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn DescriptorSource>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        Self {
            registry: Registry::new(Arc::clone(&store)),
            executor: Executor::new(Arc::clone(&store), instance_id.clone()),
            store,
            source,
            scheduler,
            descriptors: RwLock::new(HashMap::new()),
            instance_id,
            auto_run: true,
        }
    }

    /// Build from configuration: opens the SQLite ledger and picks the tokio
    /// or no-op scheduler according to `scheduling.enabled`.
    pub fn from_config(config: &AppConfig, source: Arc<dyn DescriptorSource>) -> Result<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(open_record_store(&config.database)?);
        let scheduler: Arc<dyn Scheduler> = if config.scheduling.enabled {
            Arc::new(TokioScheduler::new())
        } else {
            info!("scheduling disabled by configuration");
            Arc::new(NoopScheduler)
        };

        let mut orchestrator = Self::new(store, source, scheduler).with_auto_run(config.auto_run);
        if let Some(id) = &config.instance_id {
            orchestrator = orchestrator.with_instance_id(id.clone());
        }
        Ok(orchestrator)
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self.executor = Executor::new(Arc::clone(&self.store), self.instance_id.clone());
        self
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Host startup hook. Always initializes the ledger and registers every
    /// descriptor; the execution pass only follows when `auto_run` is enabled.
    pub async fn bootstrap(&self) -> Result<Option<RunReport>> {
        if !self.auto_run {
            let registered = self.init().await?;
            info!(
                "auto-run disabled, {registered} migration(s) registered and waiting for a trigger"
            );
            return Ok(None);
        }
        self.init_and_maybe_run().await.map(Some)
    }

    /// Create the ledger table, revoke schedules from an earlier pass and
    /// register every descriptor without executing anything. Returns the
    /// number of distinct keys registered.
    pub async fn init(&self) -> Result<usize> {
        Ok(self.prepare().await?.len())
    }

    /// Register every descriptor, then execute or schedule the eligible
    /// records in ascending `order`. Idempotent; safe to call repeatedly.
    ///
    /// Fails on store errors and on the first failing one-shot migration,
    /// which stops the remainder of the pass.
    pub async fn init_and_maybe_run(&self) -> Result<RunReport> {
        let index = self.prepare().await?;
        let records = self.store.query_eligible().await?;
        info!(
            "migration pass on {}: {} registered, {} eligible",
            self.instance_id,
            index.len(),
            records.len()
        );

        let mut report = RunReport::default();
        for record in records {
            let Some(descriptor) = index.get(&record.key).cloned() else {
                debug!("no descriptor for migration {}, skipping", record.key);
                report.skipped.push(record.key);
                continue;
            };
            self.dispatch(&record, descriptor, &mut report).await?;
        }

        info!(
            "migration pass finished: {} applied, {} recurring, {} scheduled, {} skipped",
            report.applied.len(),
            report.recurring.len() + report.failed.len(),
            report.scheduled.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Run one registered migration now, whatever its `run_on_init` flag.
    pub async fn run_migration(&self, key: &str) -> Result<ExecutionOutcome> {
        let descriptor = self
            .descriptor(key)
            .ok_or_else(|| Error::NotFound(format!("migration {key} is not registered")))?;

        if descriptor.run_once {
            self.executor.run_once(&descriptor).await
        } else {
            self.executor.run_recurring(&descriptor).await
        }
    }

    /// Look up the ledger record for `key`.
    pub async fn status(&self, key: &str) -> Result<Option<MigrationRecord>> {
        self.store.find_by_key(key).await
    }

    pub fn cancel(&self, key: &str) -> bool {
        self.scheduler.cancel(key)
    }

    /// Revoke all scheduled work. Executions already in flight finish.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.scheduler.cancel_all();
        info!("orchestrator shut down, {cancelled} schedule(s) cancelled");
        cancelled
    }

    fn descriptor(&self, key: &str) -> Option<Arc<MigrationDescriptor>> {
        self.descriptors
            .read()
            .ok()
            .and_then(|index| index.get(key).cloned())
    }

    async fn prepare(&self) -> Result<HashMap<String, Arc<MigrationDescriptor>>> {
        self.store.ensure_collection().await?;

        let stale = self.scheduler.cancel_all();
        if stale > 0 {
            debug!("revoked {stale} schedule(s) from the previous pass");
        }

        self.register_all().await
    }

    async fn register_all(&self) -> Result<HashMap<String, Arc<MigrationDescriptor>>> {
        let mut index = HashMap::new();
        for descriptor in self.source.list().await? {
            self.registry.register(&descriptor).await?;
            let key = descriptor.key.clone();
            if index.insert(key.clone(), Arc::new(descriptor)).is_some() {
                warn!("duplicate migration key {key}, the last descriptor wins");
            }
        }

        match self.descriptors.write() {
            Ok(mut current) => *current = index.clone(),
            Err(_) => return Err(Error::Other("descriptor index lock poisoned".into())),
        }
        Ok(index)
    }

    async fn dispatch(
        &self,
        record: &MigrationRecord,
        descriptor: Arc<MigrationDescriptor>,
        report: &mut RunReport,
    ) -> Result<()> {
        let key = record.key.clone();

        if let Some(predicate) = &descriptor.should_run
            && !predicate.evaluate().await
        {
            info!("migration {key} skipped: should_run returned false");
            report.skipped.push(key);
            return Ok(());
        }

        let schedule = descriptor.schedule.clone().unwrap_or_default();
        if let Some(expression) = schedule.cron.as_deref() {
            return self
                .dispatch_cron(descriptor, expression, schedule.timezone.as_deref(), report)
                .await;
        }
        if let Some(at) = schedule.at {
            return self.dispatch_at(descriptor, at, report).await;
        }

        if descriptor.run_once {
            let outcome = self.executor.run_once(&descriptor).await?;
            record_outcome(report, key, outcome);
        } else {
            let outcome = self.executor.run_recurring(&descriptor).await?;
            record_outcome(report, key, outcome);
        }
        Ok(())
    }

    async fn dispatch_cron(
        &self,
        descriptor: Arc<MigrationDescriptor>,
        expression: &str,
        timezone: Option<&str>,
        report: &mut RunReport,
    ) -> Result<()> {
        let key = descriptor.key.clone();

        if !self.scheduler.is_available() {
            warn!("scheduling unavailable, cron migration {key} will not run");
            report.skipped.push(key);
            return Ok(());
        }
        if descriptor.run_once {
            warn!("migration {key} has a cron schedule but is marked run-once; it runs on every tick");
        }

        let job = self.recurring_job(Arc::clone(&descriptor));
        if let Err(e) = self.scheduler.schedule_cron(&key, expression, timezone, job) {
            error!("failed to schedule migration {key}: {e}");
            report.skipped.push(key);
            return Ok(());
        }
        report.scheduled.push(key.clone());

        let outcome = self.executor.run_recurring(&descriptor).await?;
        record_outcome(report, key, outcome);
        Ok(())
    }

    async fn dispatch_at(
        &self,
        descriptor: Arc<MigrationDescriptor>,
        at: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let key = descriptor.key.clone();

        let run_inline = if at <= Utc::now() {
            info!("migration {key} was due at {}, running now", at.to_rfc3339());
            true
        } else if !self.scheduler.is_available() {
            warn!("scheduling unavailable, running one-off migration {key} immediately");
            true
        } else {
            false
        };

        if run_inline {
            let outcome = self.executor.run_once(&descriptor).await?;
            record_outcome(report, key, outcome);
            return Ok(());
        }

        let job = self.one_off_job(descriptor);
        match self.scheduler.schedule_once(&key, at, job) {
            Ok(()) => report.scheduled.push(key),
            Err(e) => {
                error!("failed to schedule migration {key}: {e}");
                report.skipped.push(key);
            }
        }
        Ok(())
    }

    fn recurring_job(&self, descriptor: Arc<MigrationDescriptor>) -> ScheduledJob {
        let executor = self.executor.clone();
        Arc::new(move || {
            let executor = executor.clone();
            let descriptor = Arc::clone(&descriptor);
            Box::pin(async move {
                if let Err(e) = executor.run_recurring(&descriptor).await {
                    error!("recurring migration {} could not run: {e}", descriptor.key);
                }
            })
        })
    }

    fn one_off_job(&self, descriptor: Arc<MigrationDescriptor>) -> ScheduledJob {
        let executor = self.executor.clone();
        Arc::new(move || {
            let executor = executor.clone();
            let descriptor = Arc::clone(&descriptor);
            Box::pin(async move {
                // Body failures are already recorded and logged by the executor.
                if let Err(e) = executor.run_once(&descriptor).await
                    && !e.is_migration_failure()
                {
                    error!("scheduled migration {} could not run: {e}", descriptor.key);
                }
            })
        })
    }
}

fn record_outcome(report: &mut RunReport, key: String, outcome: ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Applied => report.applied.push(key),
        ExecutionOutcome::Completed => report.recurring.push(key),
        ExecutionOutcome::Failed(_) => report.failed.push(key),
        ExecutionOutcome::Skipped => report.skipped.push(key),
    }
}
