//! LMSH Core Library
//!
//! Declarative classroom and assignment reconciliation against a hosting
//! platform, plus grade propagation from that platform into an LMS.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod grading;
pub mod locks;
pub mod manifest;
pub mod obs;
pub mod reconcile;
pub mod retry;
pub mod telemetry;

pub use adapters::{
    AdapterError, AdapterResult, GradeUpdate, HostingPlatform, Lms, RemoteAssignment,
    RemoteClassroom, RetryingHosting, RetryingLms,
};

pub use config::{EngineConfig, HookConfig};

pub use domain::{
    ownership_marker, parse_ownership_marker, select_current, AssignmentChanges, AssignmentSpec,
    ClassroomChanges, ClassroomSpec, GradingStatus, LmshError, Result, RevisionMarker, Submission,
    ValidationError,
};

pub use grading::{
    resolve_assignment, CommandHook, GradePipeline, GradingHook, HookGrade, PropagationReport,
    PropagationRequest, SubmissionOutcome, SubmissionReport,
};

pub use locks::{CancelToken, KeyGuard, KeyLocks};

pub use manifest::{Manifest, ManifestAssignment, ManifestClassroom};

pub use reconcile::{
    merge_lms_roster, Desired, ItemOutcome, ItemReport, PlanReport, ReconcileAction,
    ReconciliationEngine, ReconciliationResult, SyncReport,
};

pub use retry::RetryPolicy;

pub use lmsh_state::{
    ConfigDigest, EntityKey, EntityKind, ReconciliationRecord, StateStore, StorageError,
    SurrealStateStore,
};

/// Crate version, reported by `lmsh version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
