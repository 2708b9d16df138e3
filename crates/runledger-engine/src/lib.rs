//! Run-once and scheduled migrations coordinated through a shared ledger.
//!
//! Descriptors come from a [`DescriptorSource`]; the [`Registry`] mirrors
//! them into the [`RecordStore`](runledger_db::RecordStore); the
//! [`Orchestrator`] walks eligible records in order and hands each one to the
//! [`Executor`] or the [`Scheduler`].

pub mod descriptor;
pub mod driver;
pub mod executor;
pub mod registry;
pub mod scheduler;

pub use descriptor::{
    DescriptorSource, MigrationBody, MigrationDescriptor, ShouldRun, StaticDescriptorSource,
};
pub use driver::{Orchestrator, RunReport, open_record_store};
pub use executor::{ExecutionOutcome, Executor};
pub use registry::{Registration, Registry};
pub use scheduler::{CronSpec, NoopScheduler, ScheduledJob, Scheduler, TokioScheduler};
