//! The reconciliation engine.
//!
//! [`diff::diff`] classifies an observed batch against the stored catalog;
//! [`Syncer`] drives one pass per external service and the on-demand
//! single-repository path; [`run::run`] schedules passes through the
//! persisted job queue with a bounded worker pool; [`pruner`] revalidates
//! repositories with recorded errors.

pub mod diff;
pub mod error;
pub mod observe;
pub mod pruner;
pub mod run;
pub mod syncer;

pub use error::{SyncError, SyncResult};
pub use observe::{MetricsObserver, NoopObserver, SyncObserver};
pub use run::{RunConfig, run};
pub use syncer::{SyncProgress, Syncer, calc_sync_interval};
