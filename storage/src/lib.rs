//! Postgres persistence for the repository catalog.
//!
//! [`PgStore`] implements the [`catalog_core::CatalogStore`] contract:
//! transactional diff application through [`PgTx`], the sync-job queue with
//! its row-locking admission control, and the private-repo license gate
//! invoked on upserts.

mod error;
pub mod hook;
pub mod pg;

pub use hook::LicenseGate;
pub use pg::{PgStore, PgTx};
