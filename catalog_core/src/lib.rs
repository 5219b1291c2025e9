//! Core domain types and store contracts for the repository catalog.
//!
//! This crate is dependency-light on purpose: it holds the types shared by
//! the source adapters, the Postgres store and the reconciliation engine,
//! plus the traits those crates meet in the middle on.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use traits::{CatalogStore, PrivateRepoGate, StoreTx, UnrestrictedGate};
pub use types::{
    Diff, ExternalRepoSpec, ExternalService, ExternalServiceKind, ModifiedFields, ModifiedRepo,
    Repo, SourceInfo, SyncJob, SyncJobState
};
