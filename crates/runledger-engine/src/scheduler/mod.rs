//! Deferred and recurring execution of migrations.
//!
//! A [`Scheduler`] owns cancellable handles keyed by migration key. The
//! driver hands it a [`ScheduledJob`] that already wraps the right executor
//! path; the scheduler only decides *when* to call it.

pub mod cron_spec;
pub mod noop;
pub mod timer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use runledger_common::Result;

pub use cron_spec::CronSpec;
pub use noop::NoopScheduler;
pub use timer::TokioScheduler;

/// Work fired by a schedule. Called once per trigger.
pub type ScheduledJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Scheduler: Send + Sync {
    /// False when deferred execution is not supported in this process.
    fn is_available(&self) -> bool;

    /// Fire `job` once at `at`. Replaces any handle already held for `key`.
    fn schedule_once(&self, key: &str, at: DateTime<Utc>, job: ScheduledJob) -> Result<()>;

    /// Fire `job` on every tick of `expression` evaluated in `timezone`
    /// (UTC when `None`). Replaces any handle already held for `key`.
    fn schedule_cron(
        &self,
        key: &str,
        expression: &str,
        timezone: Option<&str>,
        job: ScheduledJob,
    ) -> Result<()>;

    /// Revoke the handle for `key`. Returns whether one existed.
    fn cancel(&self, key: &str) -> bool;

    /// Revoke every handle. Returns how many were cancelled.
    fn cancel_all(&self) -> usize;

    fn scheduled_keys(&self) -> Vec<String>;
}
