//! lmsh-state: durable reconciliation state for LMSH
//!
//! This crate owns every `ReconciliationRecord` written by the reconciliation
//! engine and the grade propagation pipeline. It maps logical entity keys
//! (classroom, assignment, student submission) to the remote identifiers and
//! configuration digests that were last applied successfully.
//!
//! ## Key Components
//!
//! - `StateStore`: backend-agnostic trait with `get` / `put` / `compare_and_swap` / `list`
//! - `MemoryStateStore`: in-memory fake for tests (`fakes` module)
//! - `SurrealStateStore`: SurrealDB-backed store (memory, SurrealKV on disk, or remote)
//! - `StoreConfig`: connection target resolved from the environment

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{CloudCredentials, StoreConfig};
pub use storage_traits::{
    ConfigDigest, EntityKey, EntityKind, ReconciliationRecord, StateStore, StorageResult,
};
pub use surreal_store::SurrealStateStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
