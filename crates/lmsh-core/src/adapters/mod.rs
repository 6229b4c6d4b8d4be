//! External service adapters.
//!
//! - `HostingPlatform`: the code-hosting classroom side (teams, repositories,
//!   submissions)
//! - `Lms`: the learning management system (rosters, grades)
//!
//! Adapters never persist state. They report failures as `AdapterError`,
//! which the engine classifies into `LmshError` before deciding whether to
//! retry or surface. HTTP implementations live in `lmsh-remote`; in-memory
//! fakes are in [`fakes`].

pub mod fakes;
pub mod retrying;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use lmsh_state::EntityKey;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AssignmentChanges, AssignmentSpec, ClassroomChanges, ClassroomSpec, LmshError, Submission,
    ValidationError,
};

pub use retrying::{RetryingHosting, RetryingLms};

/// Failures reported by adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The remote refused the payload (HTTP 400/422 and friends).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<AdapterError>,
    },
}

impl AdapterError {
    /// Rate limiting, timeouts and unavailability are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited { .. } | AdapterError::Timeout(_) | AdapterError::Unavailable(_)
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<AdapterError> for LmshError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::RateLimited { .. }
            | AdapterError::Timeout(_)
            | AdapterError::Unavailable(_)
            | AdapterError::RetriesExhausted { .. } => LmshError::Transient(err.to_string()),
            AdapterError::NotFound(what) => LmshError::NotFound(what),
            AdapterError::AlreadyExists(what) => {
                LmshError::Conflict(format!("{what} already exists remotely"))
            }
            AdapterError::Rejected(reason) => {
                LmshError::Validation(ValidationError::Other(format!("remote rejected: {reason}")))
            }
            AdapterError::Unauthorized(reason) => LmshError::Unauthorized(reason),
            AdapterError::Protocol(reason) => LmshError::Remote(reason),
        }
    }
}

/// Result type for adapter calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// A classroom as observed on the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteClassroom {
    pub id: String,
    pub name: String,
    /// Description with the ownership marker stripped.
    pub description: Option<String>,
    /// Course code carried by the ownership marker, if any.
    pub owner: Option<String>,
    pub roster: BTreeSet<String>,
    pub url: Option<String>,
}

impl RemoteClassroom {
    /// The remote state expressed as a desired classroom, for diffing.
    pub fn observed(&self, org: &str, course_code: &str) -> ClassroomSpec {
        ClassroomSpec {
            org: org.to_string(),
            course_code: course_code.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            roster: self.roster.clone(),
        }
    }
}

/// An assignment as observed on the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAssignment {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub points: Option<u32>,
    pub owner: Option<String>,
    /// Link students follow to accept the assignment.
    pub acceptance_url: Option<String>,
}

impl RemoteAssignment {
    /// The remote state expressed as a desired assignment, for diffing.
    ///
    /// Identity fields and the template come from `desired`.
    pub fn observed(&self, desired: &AssignmentSpec) -> AssignmentSpec {
        AssignmentSpec {
            title: self.title.clone(),
            description: self.description.clone(),
            due_date: self.due_date,
            points: self.points,
            ..desired.clone()
        }
    }
}

/// A grade to write to the LMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeUpdate {
    pub course_code: String,
    pub assignment: String,
    pub student: String,
    pub score: f64,
    pub feedback: Option<String>,
}

/// Code-hosting classroom platform.
///
/// Classroom methods take a classroom `EntityKey`; assignment methods take an
/// assignment `EntityKey`.
#[async_trait]
pub trait HostingPlatform: Send + Sync {
    /// Look up a classroom by its deterministic remote name.
    async fn find_classroom(&self, key: &EntityKey) -> AdapterResult<Option<RemoteClassroom>>;

    /// Create a classroom carrying the ownership marker. Fails with
    /// `AlreadyExists` when the deterministic name is taken.
    async fn create_classroom(&self, spec: &ClassroomSpec) -> AdapterResult<RemoteClassroom>;

    async fn update_classroom(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &ClassroomChanges,
    ) -> AdapterResult<RemoteClassroom>;

    async fn find_assignment(&self, key: &EntityKey) -> AdapterResult<Option<RemoteAssignment>>;

    /// Create an assignment under the classroom with remote id `classroom_id`.
    async fn create_assignment(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
    ) -> AdapterResult<RemoteAssignment>;

    async fn update_assignment(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &AssignmentChanges,
    ) -> AdapterResult<RemoteAssignment>;

    /// Attach an existing assignment to the classroom with remote id
    /// `classroom_id`. Idempotent; completes creations that stopped part way.
    async fn link_assignment(
        &self,
        classroom_id: &str,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<()>;

    /// All submission revisions the platform knows for an assignment.
    async fn list_submissions(
        &self,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<Vec<Submission>>;
}

/// Learning management system.
#[async_trait]
pub trait Lms: Send + Sync {
    /// Create or overwrite the grade for one student. Idempotent.
    async fn upsert_grade(&self, grade: &GradeUpdate) -> AdapterResult<()>;

    /// Student logins enrolled in a course.
    async fn list_roster(&self, course_code: &str) -> AdapterResult<Vec<String>>;
}
