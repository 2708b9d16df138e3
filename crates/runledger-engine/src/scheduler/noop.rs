use chrono::{DateTime, Utc};
use runledger_common::{Error, Result};

use super::{ScheduledJob, Scheduler};

/// Scheduler used when deferred execution is disabled. It arms nothing; the
/// driver sees `is_available() == false` and degrades instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn is_available(&self) -> bool {
        false
    }

    fn schedule_once(&self, key: &str, _at: DateTime<Utc>, _job: ScheduledJob) -> Result<()> {
        Err(Error::Schedule(format!(
            "scheduling is disabled, cannot defer migration {key}"
        )))
    }

    fn schedule_cron(
        &self,
        key: &str,
        _expression: &str,
        _timezone: Option<&str>,
        _job: ScheduledJob,
    ) -> Result<()> {
        Err(Error::Schedule(format!(
            "scheduling is disabled, cannot schedule migration {key}"
        )))
    }

    fn cancel(&self, _key: &str) -> bool {
        false
    }

    fn cancel_all(&self) -> usize {
        0
    }

    fn scheduled_keys(&self) -> Vec<String> {
        Vec::new()
    }
}
