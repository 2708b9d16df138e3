use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use runledger_common::{MigrationMetadata, MigrationSchedule, Result};

/// The work a migration performs. Cloning shares the same closure.
#[derive(Clone)]
pub struct MigrationBody(Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>);

impl MigrationBody {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move || Box::pin(f())))
    }

    pub fn invoke(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)()
    }
}

/// Predicate deciding, at dispatch time, whether a unit should run on this
/// process. Returning `false` leaves the record untouched.
#[derive(Clone)]
pub struct ShouldRun(Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>);

impl ShouldRun {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move || {
            let f = Arc::clone(&f);
            Box::pin(async move { f() })
        }))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self(Arc::new(move || Box::pin(f())))
    }

    /// True when the environment variable is set to a truthy value
    /// (`1`, `true`, `yes`, `on`).
    pub fn env_flag(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move || {
            std::env::var(&name)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
        })
    }

    pub async fn evaluate(&self) -> bool {
        (self.0)().await
    }
}

/// Static definition of a migration: identity, ordering, flags, schedule and
/// the body to invoke.
#[derive(Clone)]
pub struct MigrationDescriptor {
    pub key: String,
    pub service_name: String,
    pub method_name: String,
    pub order: i64,
    pub description: Option<String>,
    pub run_once: bool,
    pub retry_on_fail: bool,
    pub run_on_init: bool,
    pub schedule: Option<MigrationSchedule>,
    pub should_run: Option<ShouldRun>,
    body: MigrationBody,
}

impl MigrationDescriptor {
    /// Descriptor with an explicit key. Provenance is taken from the key:
    /// `owner.unit` splits into service and method name.
    pub fn new<F, Fut>(key: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        let (service_name, method_name) = match key.split_once('.') {
            Some((owner, unit)) => (owner.to_string(), unit.to_string()),
            None => (String::new(), key.clone()),
        };
        Self::with_parts(key, service_name, method_name, MigrationBody::new(body))
    }

    /// Descriptor keyed `<owner>.<unit>`.
    pub fn for_unit<F, Fut>(owner: impl Into<String>, unit: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let owner = owner.into();
        let unit = unit.into();
        Self::with_parts(
            format!("{owner}.{unit}"),
            owner,
            unit,
            MigrationBody::new(body),
        )
    }

    fn with_parts(
        key: String,
        service_name: String,
        method_name: String,
        body: MigrationBody,
    ) -> Self {
        Self {
            key,
            service_name,
            method_name,
            order: 0,
            description: None,
            run_once: true,
            retry_on_fail: true,
            run_on_init: true,
            schedule: None,
            should_run: None,
            body,
        }
    }

    pub fn order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn retry_on_fail(mut self, retry_on_fail: bool) -> Self {
        self.retry_on_fail = retry_on_fail;
        self
    }

    pub fn run_on_init(mut self, run_on_init: bool) -> Self {
        self.run_on_init = run_on_init;
        self
    }

    pub fn schedule(mut self, schedule: MigrationSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// One-off run at `at`.
    pub fn at(self, at: DateTime<Utc>) -> Self {
        self.schedule(MigrationSchedule::at(at))
    }

    /// Recurring run on a cron cadence. Marks the unit as recurring.
    pub fn cron(self, expression: impl Into<String>) -> Self {
        self.run_once(false)
            .schedule(MigrationSchedule::cron(expression))
    }

    pub fn should_run(mut self, predicate: ShouldRun) -> Self {
        self.should_run = Some(predicate);
        self
    }

    pub fn body(&self) -> &MigrationBody {
        &self.body
    }

    /// The fields mirrored onto the stored record.
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
            schedule: self.schedule.clone().filter(|s| !s.is_empty()),
        }
    }
}

impl fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("key", &self.key)
            .field("order", &self.order)
            .field("run_once", &self.run_once)
            .field("retry_on_fail", &self.retry_on_fail)
            .field("run_on_init", &self.run_on_init)
            .field("schedule", &self.schedule)
            .field("should_run", &self.should_run.is_some())
            .finish_non_exhaustive()
    }
}

/// Supplies the current set of descriptors. How they are discovered is up to
/// the host; the driver calls [`DescriptorSource::list`] once per pass.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn list(&self) -> Result<Vec<MigrationDescriptor>>;
}

/// A fixed list of descriptors built by the host at startup.
#[derive(Default, Clone)]
pub struct StaticDescriptorSource {
    descriptors: Vec<MigrationDescriptor>,
}

impl StaticDescriptorSource {
    pub fn new(descriptors: Vec<MigrationDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn push(&mut self, descriptor: MigrationDescriptor) {
        self.descriptors.push(descriptor);
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[async_trait]
impl DescriptorSource for StaticDescriptorSource {
    async fn list(&self) -> Result<Vec<MigrationDescriptor>> {
        Ok(self.descriptors.clone())
    }
}

#[async_trait]
impl DescriptorSource for Vec<MigrationDescriptor> {
    async fn list(&self) -> Result<Vec<MigrationDescriptor>> {
        Ok(self.clone())
    }
}
