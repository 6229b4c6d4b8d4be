//! Storage trait definitions for LMSH
//!
//! - `EntityKey`: logical identity of a classroom, assignment or submission
//! - `ReconciliationRecord`: last successfully reconciled state of one key
//! - `StateStore`: backend-agnostic persistence with compare-and-swap
//!
//! The store is the only shared mutable resource in LMSH. Writers use
//! `compare_and_swap` so that overlapping runs for the same key never lose
//! each other's updates. In-memory fakes are provided via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ConfigDigest
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of a desired configuration.
///
/// The inner field is private so the string is always valid lowercase hex
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigDigest(String);

impl ConfigDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ConfigDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ConfigDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ConfigDigest(s.to_ascii_lowercase()))
    }
}

impl From<ConfigDigest> for String {
    fn from(digest: ConfigDigest) -> Self {
        digest.0
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityKey
// ---------------------------------------------------------------------------

/// The kind of entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Classroom,
    Assignment,
    Submission,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Classroom => "classroom",
            EntityKind::Assignment => "assignment",
            EntityKind::Submission => "submission",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "classroom" => Ok(EntityKind::Classroom),
            "assignment" => Ok(EntityKind::Assignment),
            "submission" => Ok(EntityKind::Submission),
            other => Err(StorageError::InvalidKey {
                key: other.to_string(),
            }),
        }
    }
}

/// Logical identity of a reconciled entity.
///
/// Keys nest: a submission belongs to an assignment, which belongs to a
/// classroom identified by (organization, course code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Classroom {
        org: String,
        course_code: String,
    },
    Assignment {
        org: String,
        course_code: String,
        assignment: String,
    },
    Submission {
        org: String,
        course_code: String,
        assignment: String,
        student: String,
    },
}

/// Course codes name one team whatever their case; keys store them uppercase.
fn course(course_code: impl Into<String>) -> String {
    let mut code = course_code.into();
    code.make_ascii_uppercase();
    code
}

impl EntityKey {
    pub fn classroom(org: impl Into<String>, course_code: impl Into<String>) -> Self {
        EntityKey::Classroom {
            org: org.into(),
            course_code: course(course_code),
        }
    }

    pub fn assignment(
        org: impl Into<String>,
        course_code: impl Into<String>,
        assignment: impl Into<String>,
    ) -> Self {
        EntityKey::Assignment {
            org: org.into(),
            course_code: course(course_code),
            assignment: assignment.into(),
        }
    }

    /// Submission key under this assignment key.
    ///
    /// Returns `None` when called on anything but an assignment key.
    pub fn submission(&self, student: impl Into<String>) -> Option<Self> {
        match self {
            EntityKey::Assignment {
                org,
                course_code,
                assignment,
            } => Some(EntityKey::Submission {
                org: org.clone(),
                course_code: course_code.clone(),
                assignment: assignment.clone(),
                student: student.into(),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::Classroom { .. } => EntityKind::Classroom,
            EntityKey::Assignment { .. } => EntityKind::Assignment,
            EntityKey::Submission { .. } => EntityKind::Submission,
        }
    }

    pub fn org(&self) -> &str {
        match self {
            EntityKey::Classroom { org, .. }
            | EntityKey::Assignment { org, .. }
            | EntityKey::Submission { org, .. } => org,
        }
    }

    pub fn course_code(&self) -> &str {
        match self {
            EntityKey::Classroom { course_code, .. }
            | EntityKey::Assignment { course_code, .. }
            | EntityKey::Submission { course_code, .. } => course_code,
        }
    }

    /// Assignment component, if this key is below a classroom.
    pub fn assignment_key(&self) -> Option<&str> {
        match self {
            EntityKey::Classroom { .. } => None,
            EntityKey::Assignment { assignment, .. } | EntityKey::Submission { assignment, .. } => {
                Some(assignment)
            }
        }
    }

    /// The classroom this key belongs to (itself for classroom keys).
    pub fn classroom_key(&self) -> EntityKey {
        EntityKey::classroom(self.org(), self.course_code())
    }

    /// Stable string id used as the primary key by storage backends.
    ///
    /// Format: `<kind>/<org>/<course>[/<assignment>[/<student>]]`
    pub fn storage_id(&self) -> String {
        match self {
            EntityKey::Classroom { org, course_code } => {
                format!("classroom/{org}/{course_code}")
            }
            EntityKey::Assignment {
                org,
                course_code,
                assignment,
            } => format!("assignment/{org}/{course_code}/{assignment}"),
            EntityKey::Submission {
                org,
                course_code,
                assignment,
                student,
            } => format!("submission/{org}/{course_code}/{assignment}/{student}"),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

impl FromStr for EntityKey {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidKey { key: s.to_string() };
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match (parts.first().copied(), parts.len()) {
            (Some("classroom"), 3) => Ok(EntityKey::classroom(parts[1], parts[2])),
            (Some("assignment"), 4) => Ok(EntityKey::assignment(parts[1], parts[2], parts[3])),
            (Some("submission"), 5) => EntityKey::assignment(parts[1], parts[2], parts[3])
                .submission(parts[4])
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconciliationRecord
// ---------------------------------------------------------------------------

/// Last successfully reconciled state for one logical key.
///
/// A record exists only after the remote entity was created (or adopted), or,
/// for submissions, after a grade was pushed. `revision` is assigned by the
/// store and increases on every write; `compare_and_swap` compares on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub key: EntityKey,
    /// Identifier of the entity on the remote system
    pub remote_id: String,
    /// Browser URL or acceptance link, when the remote exposes one
    pub remote_url: Option<String>,
    /// Digest of the configuration last applied remotely
    pub config_digest: ConfigDigest,
    /// The configuration last applied remotely (used for field-level diffs)
    pub applied: serde_json::Value,
    /// Last propagated submission revision (submission records only)
    pub revision_marker: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub revision: u64,
}

impl ReconciliationRecord {
    pub fn new(
        key: EntityKey,
        remote_id: impl Into<String>,
        config_digest: ConfigDigest,
        applied: serde_json::Value,
    ) -> Self {
        Self {
            key,
            remote_id: remote_id.into(),
            remote_url: None,
            config_digest,
            applied,
            revision_marker: None,
            last_synced_at: Utc::now(),
            last_error: None,
            revision: 0,
        }
    }

    pub fn with_remote_url(mut self, url: Option<String>) -> Self {
        self.remote_url = url;
        self
    }

    pub fn with_revision_marker(mut self, marker: Option<String>) -> Self {
        self.revision_marker = marker;
        self
    }

    /// Successor record after a successful sync of `applied`.
    ///
    /// Clears `last_error` and refreshes `last_synced_at`.
    pub fn synced(&self, config_digest: ConfigDigest, applied: serde_json::Value) -> Self {
        Self {
            config_digest,
            applied,
            last_synced_at: Utc::now(),
            last_error: None,
            ..self.clone()
        }
    }

    /// Successor record that only remembers a failed attempt.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Durable mapping from `EntityKey` to `ReconciliationRecord`.
///
/// Guarantees:
/// - `get` returns the latest committed record, or `None` if never written.
/// - Every successful write stores `revision = previous + 1` (1 for the first).
/// - `compare_and_swap` writes only if the stored revision equals the
///   revision of `expected` (`None` = key absent) and reports whether it did.
/// - Records are never deleted.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the record for `key`, if any.
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<ReconciliationRecord>>;

    /// Unconditionally write `record` under `key`, returning the stored record.
    ///
    /// Not used by the engine; intended for operator tooling and imports.
    async fn put(
        &self,
        key: &EntityKey,
        record: ReconciliationRecord,
    ) -> StorageResult<ReconciliationRecord>;

    /// Optimistic write. Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &EntityKey,
        expected: Option<&ReconciliationRecord>,
        new: ReconciliationRecord,
    ) -> StorageResult<bool>;

    /// List records, optionally restricted to one kind, ordered by storage id.
    async fn list(&self, kind: Option<EntityKind>) -> StorageResult<Vec<ReconciliationRecord>>;
}

/// Reject records whose embedded key differs from the storage key.
pub(crate) fn ensure_key_matches(
    key: &EntityKey,
    record: &ReconciliationRecord,
) -> StorageResult<()> {
    if &record.key != key {
        return Err(StorageError::KeyMismatch {
            expected: key.storage_id(),
            actual: record.key.storage_id(),
        });
    }
    Ok(())
}
