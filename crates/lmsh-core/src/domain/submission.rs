//! Student submissions and revision markers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Grading state reported by the hosting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Ungraded,
    AutoGraded,
    ManuallyGraded,
    Failed,
}

impl fmt::Display for GradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GradingStatus::Ungraded => "ungraded",
            GradingStatus::AutoGraded => "auto_graded",
            GradingStatus::ManuallyGraded => "manually_graded",
            GradingStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One revision of a student's work on an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub student: String,
    /// Remote repository reference (e.g. `org/cs101-midterm-octocat`).
    pub repository: String,
    /// Raw revision marker: commit SHA or RFC 3339 timestamp.
    pub revision: String,
    pub submitted_at: DateTime<Utc>,
    pub status: GradingStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Submission {
    pub fn new(
        student: impl Into<String>,
        repository: impl Into<String>,
        revision: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            student: student.into(),
            repository: repository.into(),
            revision: revision.into(),
            submitted_at,
            status: GradingStatus::Ungraded,
            score: None,
            max_score: None,
            feedback: None,
        }
    }

    /// Mark as auto-graded with `score`.
    pub fn graded(mut self, score: f64) -> Self {
        self.status = GradingStatus::AutoGraded;
        self.score = Some(score);
        self
    }

    pub fn marker(&self) -> Option<RevisionMarker> {
        RevisionMarker::parse(&self.revision)
    }
}

/// Parsed revision marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionMarker {
    /// Abbreviated or full commit SHA (7–40 hex chars), lowercased.
    Commit(String),
    Timestamp(DateTime<Utc>),
}

impl RevisionMarker {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if (7..=40).contains(&raw.len()) && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(RevisionMarker::Commit(raw.to_ascii_lowercase()));
        }
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| RevisionMarker::Timestamp(ts.with_timezone(&Utc)))
    }
}

impl fmt::Display for RevisionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionMarker::Commit(sha) => f.write_str(sha),
            RevisionMarker::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// Split submissions into the current one per student and the superseded rest.
///
/// The current submission is the latest by `submitted_at`; ties are broken by
/// the raw revision string so the choice is deterministic. Output is ordered
/// by student.
pub fn select_current(submissions: Vec<Submission>) -> (Vec<Submission>, Vec<Submission>) {
    let mut by_student: BTreeMap<String, Vec<Submission>> = BTreeMap::new();
    for submission in submissions {
        by_student
            .entry(submission.student.clone())
            .or_default()
            .push(submission);
    }

    let mut current = Vec::new();
    let mut superseded = Vec::new();
    for (_, mut revisions) in by_student {
        revisions.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.revision.cmp(&b.revision))
        });
        if let Some(latest) = revisions.pop() {
            current.push(latest);
        }
        superseded.extend(revisions);
    }
    (current, superseded)
}
