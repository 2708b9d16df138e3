use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use runledger_common::Result;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::{CronSpec, ScheduledJob, Scheduler};

/// Longest single timer the scheduler arms (the largest signed 32-bit
/// millisecond delay). Longer waits are split into several sleeps.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

struct ScheduledHandle {
    id: u64,
    abort: AbortHandle,
}

/// Scheduler backed by tokio timers. Each armed schedule is a spawned task;
/// firing a job never happens inside an abortable section, so cancelling a
/// key never interrupts a migration that is already executing.
pub struct TokioScheduler {
    handles: Arc<DashMap<String, ScheduledHandle>>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn install(&self, key: &str, id: u64, abort: AbortHandle) {
        if let Some(previous) = self
            .handles
            .insert(key.to_string(), ScheduledHandle { id, abort })
        {
            previous.abort.abort();
            debug!("replaced existing schedule for migration {key}");
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl Scheduler for TokioScheduler {
    fn is_available(&self) -> bool {
        true
    }

    fn schedule_once(&self, key: &str, at: DateTime<Utc>, job: ScheduledJob) -> Result<()> {
        let id = self.next_id();
        let handles = Arc::clone(&self.handles);
        let owned_key = key.to_string();
        // The task waits until its handle is installed, so it can never
        // remove itself before it has been recorded.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            sleep_until(at).await;
            handles.remove_if(&owned_key, |_, handle| handle.id == id);
            info!("one-off schedule for migration {owned_key} fired");
            job().await;
        });

        self.install(key, id, task.abort_handle());
        let _ = armed_tx.send(());
        info!("migration {key} scheduled for {}", at.to_rfc3339());
        Ok(())
    }

    fn schedule_cron(
        &self,
        key: &str,
        expression: &str,
        timezone: Option<&str>,
        job: ScheduledJob,
    ) -> Result<()> {
        let spec = CronSpec::parse(expression, timezone)?;
        let id = self.next_id();
        let handles = Arc::clone(&self.handles);
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            loop {
                let Some(next) = spec.next_after(Utc::now()) else {
                    warn!(
                        "cron schedule {} for migration {owned_key} has no upcoming fire time",
                        spec.expression()
                    );
                    break;
                };
                sleep_until(next).await;
                debug!("cron tick for migration {owned_key}");
                tokio::spawn(job());
            }
            handles.remove_if(&owned_key, |_, handle| handle.id == id);
        });

        self.install(key, id, task.abort_handle());
        info!(
            "migration {key} scheduled on cron {expression} ({})",
            timezone.unwrap_or("UTC")
        );
        Ok(())
    }

    fn cancel(&self, key: &str) -> bool {
        match self.handles.remove(key) {
            Some((_, handle)) => {
                handle.abort.abort();
                debug!("cancelled schedule for migration {key}");
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) -> usize {
        self.scheduled_keys()
            .iter()
            .filter(|key| self.cancel(key))
            .count()
    }

    fn scheduled_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

/// Sleep until the wall clock reaches `at`, in slices no longer than
/// [`MAX_TIMER_DELAY`].
async fn sleep_until(at: DateTime<Utc>) {
    loop {
        let Ok(remaining) = (at - Utc::now()).to_std() else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(MAX_TIMER_DELAY)).await;
    }
}
