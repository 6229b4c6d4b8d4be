//! Grade propagation pipeline
//!
//! Moves grading outcomes from the hosting platform to the LMS, exactly once
//! per submission revision:
//!
//! 1. resolve the assignment against recorded assignments
//! 2. list submissions; keep the latest per student, report the rest as
//!    superseded
//! 3. skip revisions already propagated (same marker) or older than the
//!    recorded submission time
//! 4. score via the grading hook (`auto`) or take the platform's score
//! 5. upsert the grade in the LMS, then record the marker with
//!    compare-and-swap
//!
//! Submissions without a parsable revision marker are always propagated and
//! flagged `non_idempotent`. One student's failure never blocks another.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lmsh_state::{ConfigDigest, EntityKey, EntityKind, ReconciliationRecord, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adapters::{GradeUpdate, HostingPlatform, Lms, RetryingHosting, RetryingLms};
use crate::config::{EngineConfig, HookConfig};
use crate::domain::validation::validate_student;
use crate::domain::{
    digest, select_current, LmshError, Result, RevisionMarker, Submission, ValidationError,
};
use crate::locks::{CancelToken, KeyLocks};
use crate::obs;
use crate::reconcile::elapsed_ms;

// ---------------------------------------------------------------------------
// Grading hooks
// ---------------------------------------------------------------------------

/// Score produced by a grading hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookGrade {
    pub score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Pluggable automatic grading.
#[async_trait]
pub trait GradingHook: Send + Sync {
    async fn grade(&self, assignment: &EntityKey, submission: &Submission) -> Result<HookGrade>;
}

/// What a `CommandHook` receives on stdin.
#[derive(Debug, Serialize)]
struct HookInput<'a> {
    org: &'a str,
    course_code: &'a str,
    assignment: &'a str,
    submission: &'a Submission,
}

/// Runs an operator-supplied command per submission.
///
/// The submission is written to stdin as JSON; stdout must be
/// `{"score": <number>, "feedback": <string, optional>}`. A non-zero exit,
/// a timeout or unparsable output is a hook failure.
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHook {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from a whitespace-separated command line.
    pub fn from_config(config: &HookConfig) -> Result<Self> {
        let mut parts = config.command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ValidationError::Empty {
            field: "grading hook command",
        })?;
        Ok(Self::new(program, parts.collect(), config.timeout()))
    }

    fn failure(&self, msg: impl std::fmt::Display) -> LmshError {
        LmshError::GradingHook(format!("{}: {msg}", self.program))
    }
}

#[async_trait]
impl GradingHook for CommandHook {
    async fn grade(&self, assignment: &EntityKey, submission: &Submission) -> Result<HookGrade> {
        let input = HookInput {
            org: assignment.org(),
            course_code: assignment.course_code(),
            assignment: assignment.assignment_key().unwrap_or_default(),
            submission,
        };
        let payload = serde_json::to_vec(&input)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("failed to start: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a hook that ignores its input may exit before reading it
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(self.failure(format!("failed to write input: {e}")));
                }
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| self.failure(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| self.failure(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let grade: HookGrade = serde_json::from_slice(&output.stdout)
            .map_err(|e| self.failure(format!("unparsable output: {e}")))?;
        if !grade.score.is_finite() || grade.score < 0.0 {
            return Err(self.failure(format!("invalid score {}", grade.score)));
        }
        Ok(grade)
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Input to [`GradePipeline::propagate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationRequest {
    /// Assignment key (case-insensitive) or remote id.
    pub assignment_id: String,
    pub org: Option<String>,
    pub course_code: Option<String>,
    /// Only propagate this student's submission.
    pub student: Option<String>,
    /// Score through the grading hook.
    pub auto: bool,
}

impl PropagationRequest {
    pub fn new(assignment_id: impl Into<String>) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            ..Self::default()
        }
    }

    pub fn scoped(mut self, org: Option<String>, course_code: Option<String>) -> Self {
        self.org = org;
        self.course_code = course_code;
        self
    }

    pub fn for_student(mut self, student: Option<String>) -> Self {
        self.student = student;
        self
    }

    pub fn auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }
}

/// What happened to one submission revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Propagated { score: f64 },
    /// This revision was already propagated.
    Unchanged,
    /// A newer revision by the same student exists.
    Superseded,
    /// Older than the submission already recorded.
    Stale,
    Skipped { reason: String },
    Failed { category: String, error: String },
}

impl SubmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionOutcome::Propagated { .. } => "propagated",
            SubmissionOutcome::Unchanged => "unchanged",
            SubmissionOutcome::Superseded => "superseded",
            SubmissionOutcome::Stale => "stale",
            SubmissionOutcome::Skipped { .. } => "skipped",
            SubmissionOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReport {
    pub student: String,
    pub revision: String,
    #[serde(flatten)]
    pub outcome: SubmissionOutcome,
    /// No parsable revision marker: re-running will propagate again.
    pub non_idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationReport {
    pub assignment: String,
    pub auto: bool,
    pub submissions: Vec<SubmissionReport>,
}

impl PropagationReport {
    fn count(&self, f: impl Fn(&SubmissionOutcome) -> bool) -> usize {
        self.submissions.iter().filter(|s| f(&s.outcome)).count()
    }

    pub fn propagated(&self) -> usize {
        self.count(|o| matches!(o, SubmissionOutcome::Propagated { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SubmissionOutcome::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Report entry for `student`'s current revision.
    pub fn current_for(&self, student: &str) -> Option<&SubmissionReport> {
        self.submissions
            .iter()
            .find(|s| s.student == student && s.outcome != SubmissionOutcome::Superseded)
    }
}

/// Snapshot stored in a submission record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PropagatedGrade {
    score: f64,
    feedback: Option<String>,
    revision: String,
    submitted_at: DateTime<Utc>,
    repository: String,
}

impl PropagatedGrade {
    fn recorded(record: &ReconciliationRecord) -> Option<Self> {
        serde_json::from_value(record.applied.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Assignment resolution
// ---------------------------------------------------------------------------

/// Find the recorded assignment named by `id` (assignment key, case-insensitive,
/// or remote id), optionally scoped to an organization and course.
pub async fn resolve_assignment(
    store: &dyn StateStore,
    id: &str,
    org: Option<&str>,
    course_code: Option<&str>,
) -> Result<ReconciliationRecord> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ValidationError::Empty {
            field: "assignment id",
        }
        .into());
    }

    let mut matches: Vec<ReconciliationRecord> = store
        .list(Some(EntityKind::Assignment))
        .await?
        .into_iter()
        .filter(|r| org.map_or(true, |o| r.key.org().eq_ignore_ascii_case(o)))
        .filter(|r| course_code.map_or(true, |c| r.key.course_code().eq_ignore_ascii_case(c)))
        .filter(|r| {
            r.key
                .assignment_key()
                .is_some_and(|k| k.eq_ignore_ascii_case(id))
                || r.remote_id.eq_ignore_ascii_case(id)
        })
        .collect();

    match matches.len() {
        0 => Err(LmshError::NotFound(format!(
            "no provisioned assignment matches {id:?}"
        ))),
        1 => Ok(matches.remove(0)),
        _ => {
            let keys: Vec<String> = matches.iter().map(|r| r.key.storage_id()).collect();
            Err(ValidationError::Other(format!(
                "assignment id {id:?} is ambiguous ({}); narrow it with an organization or course code",
                keys.join(", ")
            ))
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Propagates hosting-platform grades to the LMS.
pub struct GradePipeline {
    hosting: Arc<dyn HostingPlatform>,
    lms: Arc<dyn Lms>,
    store: Arc<dyn StateStore>,
    hook: Option<Arc<dyn GradingHook>>,
    config: EngineConfig,
    locks: KeyLocks,
}

impl GradePipeline {
    /// Both adapters are wrapped in retrying decorators using `config.retry`.
    pub fn new(
        hosting: Arc<dyn HostingPlatform>,
        lms: Arc<dyn Lms>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            hosting: Arc::new(RetryingHosting::new(hosting, config.retry.clone())),
            lms: Arc::new(RetryingLms::new(lms, config.retry.clone())),
            store,
            hook: None,
            config,
            locks: KeyLocks::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn GradingHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub async fn propagate(
        &self,
        request: &PropagationRequest,
        cancel: &CancelToken,
    ) -> Result<PropagationReport> {
        if let Some(student) = &request.student {
            validate_student(student)?;
        }
        let assignment = resolve_assignment(
            self.store.as_ref(),
            &request.assignment_id,
            request.org.as_deref(),
            request.course_code.as_deref(),
        )
        .await?;
        let key = assignment.key.clone();
        cancel.check()?;

        let started = Instant::now();
        let mut submissions = self
            .hosting
            .list_submissions(&key, &assignment.remote_id)
            .await?;
        if let Some(student) = &request.student {
            submissions.retain(|s| s.student.eq_ignore_ascii_case(student));
        }
        let (current, superseded) = select_current(submissions);
        obs::emit_propagate_started(&key, current.len(), request.auto);

        let mut reports: Vec<SubmissionReport> = superseded
            .into_iter()
            .map(|s| SubmissionReport {
                non_idempotent: s.marker().is_none(),
                student: s.student,
                revision: s.revision,
                outcome: SubmissionOutcome::Superseded,
            })
            .collect();

        let processed: Vec<SubmissionReport> = stream::iter(current)
            .map(|submission| self.process(&key, submission, request.auto, cancel))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        reports.extend(processed);
        reports.sort_by(|a, b| {
            a.student
                .cmp(&b.student)
                .then_with(|| {
                    let superseded = |r: &SubmissionReport| r.outcome == SubmissionOutcome::Superseded;
                    superseded(a).cmp(&superseded(b))
                })
                .then_with(|| a.revision.cmp(&b.revision))
        });

        let report = PropagationReport {
            assignment: key.storage_id(),
            auto: request.auto,
            submissions: reports,
        };
        obs::emit_propagate_finished(
            &key,
            report.propagated(),
            report.failed(),
            elapsed_ms(started),
        );
        Ok(report)
    }

    async fn process(
        &self,
        assignment: &EntityKey,
        submission: Submission,
        auto: bool,
        cancel: &CancelToken,
    ) -> SubmissionReport {
        let outcome = match self.process_one(assignment, &submission, auto, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => SubmissionOutcome::Failed {
                category: err.category().to_string(),
                error: err.to_string(),
            },
        };
        obs::emit_propagate_submission(
            assignment,
            &submission.student,
            &submission.revision,
            outcome.as_str(),
        );
        SubmissionReport {
            non_idempotent: submission.marker().is_none(),
            student: submission.student,
            revision: submission.revision,
            outcome,
        }
    }

    async fn process_one(
        &self,
        assignment: &EntityKey,
        submission: &Submission,
        auto: bool,
        cancel: &CancelToken,
    ) -> Result<SubmissionOutcome> {
        let key = assignment.submission(&submission.student).ok_or_else(|| {
            LmshError::NotFound(format!("{assignment} is not an assignment key"))
        })?;
        let _guard = self.locks.lock(&key).await;
        cancel.check()?;

        let existing = self.store.get(&key).await?;
        let marker = submission.marker();
        if let (Some(record), Some(marker)) = (&existing, &marker) {
            let recorded_marker = record
                .revision_marker
                .as_deref()
                .and_then(RevisionMarker::parse);
            if recorded_marker.as_ref() == Some(marker) {
                return Ok(SubmissionOutcome::Unchanged);
            }
            if let Some(recorded) = PropagatedGrade::recorded(record) {
                if submission.submitted_at < recorded.submitted_at {
                    return Ok(SubmissionOutcome::Stale);
                }
            }
        }

        let (score, feedback) = match (&self.hook, auto) {
            (Some(hook), true) => match hook.grade(assignment, submission).await {
                Ok(grade) => (grade.score, grade.feedback),
                Err(err) => {
                    self.note_failure(existing.as_ref(), &err).await;
                    return Err(err);
                }
            },
            _ => match submission.score {
                Some(score) => (score, submission.feedback.clone()),
                None => {
                    return Ok(SubmissionOutcome::Skipped {
                        reason: "ungraded".to_string(),
                    })
                }
            },
        };
        cancel.check()?;

        let grade = GradeUpdate {
            course_code: assignment.course_code().to_string(),
            assignment: assignment.assignment_key().unwrap_or_default().to_string(),
            student: submission.student.clone(),
            score,
            feedback: feedback.clone(),
        };
        if let Err(err) = self.lms.upsert_grade(&grade).await {
            let err = LmshError::from(err);
            self.note_failure(existing.as_ref(), &err).await;
            return Err(err);
        }

        let (applied, digest) = digest::snapshot(&PropagatedGrade {
            score,
            feedback,
            revision: submission.revision.clone(),
            submitted_at: submission.submitted_at,
            repository: submission.repository.clone(),
        })?;
        self.record_marker(&key, existing, submission, applied, digest)
            .await?;
        Ok(SubmissionOutcome::Propagated { score })
    }

    /// Write the propagated marker, re-reading on lost races.
    async fn record_marker(
        &self,
        key: &EntityKey,
        mut expected: Option<ReconciliationRecord>,
        submission: &Submission,
        applied: Value,
        digest: ConfigDigest,
    ) -> Result<()> {
        let marker = Some(submission.revision.clone());
        for _ in 0..self.config.cas_budget {
            let next = match &expected {
                Some(record) => record
                    .synced(digest.clone(), applied.clone())
                    .with_revision_marker(marker.clone()),
                None => ReconciliationRecord::new(
                    key.clone(),
                    &submission.repository,
                    digest.clone(),
                    applied.clone(),
                )
                .with_revision_marker(marker.clone()),
            };
            if self
                .store
                .compare_and_swap(key, expected.as_ref(), next)
                .await?
            {
                return Ok(());
            }
            debug!(key = %key, "submission record changed concurrently, re-reading");
            expected = self.store.get(key).await?;
            if expected
                .as_ref()
                .is_some_and(|r| r.revision_marker == marker)
            {
                return Ok(());
            }
        }
        Err(LmshError::Conflict(format!(
            "{key}: grade pushed but marker not recorded after {} attempts",
            self.config.cas_budget
        )))
    }

    /// Remember a failure on an existing submission record. No record is
    /// created for submissions that were never propagated.
    async fn note_failure(&self, existing: Option<&ReconciliationRecord>, err: &LmshError) {
        let Some(record) = existing else {
            return;
        };
        match self
            .store
            .compare_and_swap(&record.key, Some(record), record.failed(err.to_string()))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(key = %record.key, "record moved on, last_error not written"),
            Err(store_err) => {
                warn!(key = %record.key, error = %store_err, "failed to record last_error")
            }
        }
    }
}
