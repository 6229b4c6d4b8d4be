//! Grade propagation tests: exactly-once per revision, per-student failure
//! isolation and assignment resolution.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lmsh_core::adapters::fakes::{FakeHostingPlatform, FakeLms, Op};
use lmsh_core::{
    AdapterError, AssignmentSpec, CancelToken, ClassroomSpec, EngineConfig, EntityKey,
    GradePipeline, GradingHook, HookGrade, LmshError, PropagationRequest, ReconciliationEngine,
    RemoteAssignment, Result, RetryPolicy, StateStore, Submission, SubmissionOutcome,
};
use lmsh_state::fakes::MemoryStateStore;

const ORG: &str = "lmsh-test";

fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: false,
        },
        ..EngineConfig::default()
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 15, hour, 0, 0).unwrap()
}

fn submission(student: &str, revision: &str, hour: u32) -> Submission {
    Submission::new(
        student,
        format!("{ORG}/cs101-midterm-2024-{student}"),
        revision,
        at(hour),
    )
}

/// Fails for the listed students, scores everyone else 90.
struct ScriptedHook {
    failing: HashSet<String>,
}

impl ScriptedHook {
    fn failing(students: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: students.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl GradingHook for ScriptedHook {
    async fn grade(&self, _assignment: &EntityKey, submission: &Submission) -> Result<HookGrade> {
        if self.failing.contains(&submission.student) {
            return Err(LmshError::GradingHook("autograder crashed".to_string()));
        }
        Ok(HookGrade {
            score: 90.0,
            feedback: Some("all tests pass".to_string()),
        })
    }
}

struct Fixture {
    hosting: Arc<FakeHostingPlatform>,
    lms: Arc<FakeLms>,
    store: Arc<MemoryStateStore>,
    assignment_id: String,
}

impl Fixture {
    /// Classroom CS101 with one provisioned assignment titled `title`.
    async fn new(title: &str) -> Self {
        let hosting = Arc::new(FakeHostingPlatform::new());
        let store = Arc::new(MemoryStateStore::new());
        let engine = ReconciliationEngine::new(hosting.clone(), store.clone(), config());
        let cancel = CancelToken::new();
        engine
            .reconcile_classroom(&ClassroomSpec::new(ORG, "CS101", "Intro to CS"), &cancel)
            .await
            .unwrap();
        let assignment = engine
            .reconcile_assignment(&AssignmentSpec::new(ORG, "CS101", title), &cancel)
            .await
            .unwrap();
        Self {
            hosting,
            lms: Arc::new(FakeLms::new()),
            store,
            assignment_id: assignment.remote_id,
        }
    }

    fn submit(&self, submission: Submission) {
        self.hosting.add_submission(&self.assignment_id, submission);
    }

    fn pipeline(&self) -> GradePipeline {
        GradePipeline::new(
            self.hosting.clone(),
            self.lms.clone(),
            self.store.clone(),
            config(),
        )
    }

    fn record_key(&self, assignment: &str, student: &str) -> EntityKey {
        EntityKey::assignment(ORG, "CS101", assignment)
            .submission(student)
            .unwrap()
    }
}

#[tokio::test]
async fn test_hook_failure_is_isolated_per_student() {
    let fx = Fixture::new("Midterm 2024").await;
    fx.submit(submission("alice", "abc1234", 9));
    fx.submit(submission("bob", "def5678", 10));
    let pipeline = fx.pipeline().with_hook(ScriptedHook::failing(&["bob"]));
    let request = PropagationRequest::new("MIDTERM-2024").auto(true);

    let report = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(report.assignment, "assignment/lmsh-test/CS101/midterm-2024");
    assert_eq!(report.propagated(), 1);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_success());
    assert_eq!(report.submissions[0].student, "alice");
    assert_eq!(
        report.submissions[0].outcome,
        SubmissionOutcome::Propagated { score: 90.0 }
    );
    assert!(matches!(
        report.submissions[1].outcome,
        SubmissionOutcome::Failed { ref category, .. } if category == "grading_hook"
    ));

    let grade = fx.lms.grade_for("alice").unwrap();
    assert_eq!(grade.course_code, "CS101");
    assert_eq!(grade.assignment, "midterm-2024");
    assert_eq!(grade.feedback.as_deref(), Some("all tests pass"));
    assert!(fx.lms.grade_for("bob").is_none());

    let alice = fx
        .store
        .get(&fx.record_key("midterm-2024", "alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice.revision_marker.as_deref(), Some("abc1234"));
    assert_eq!(alice.applied["score"], 90.0);
    assert!(fx
        .store
        .get(&fx.record_key("midterm-2024", "bob"))
        .await
        .unwrap()
        .is_none());

    // the rerun retries bob only
    let rerun = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(
        rerun.current_for("alice").unwrap().outcome,
        SubmissionOutcome::Unchanged
    );
    assert_eq!(rerun.failed(), 1);
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 1);
}

#[tokio::test]
async fn test_each_revision_is_propagated_once() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "abc1234", 9).graded(85.0));
    let pipeline = fx.pipeline();
    let request = PropagationRequest::new("midterm");
    let cancel = CancelToken::new();

    let first = pipeline.propagate(&request, &cancel).await.unwrap();
    assert_eq!(first.propagated(), 1);
    let second = pipeline.propagate(&request, &cancel).await.unwrap();
    assert_eq!(second.propagated(), 0);
    assert_eq!(
        second.current_for("alice").unwrap().outcome,
        SubmissionOutcome::Unchanged
    );
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 1);

    // a new revision is propagated again
    fx.submit(submission("alice", "0123abcd", 11).graded(95.0));
    let third = pipeline.propagate(&request, &cancel).await.unwrap();
    assert_eq!(
        third.current_for("alice").unwrap().outcome,
        SubmissionOutcome::Propagated { score: 95.0 }
    );
    assert_eq!(fx.lms.grades().len(), 2);
    assert_eq!(fx.lms.grade_for("alice").unwrap().score, 95.0);
}

#[tokio::test]
async fn test_marker_comparison_ignores_case() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "ABC1234", 9).graded(85.0));
    let pipeline = fx.pipeline();
    let request = PropagationRequest::new("midterm");
    pipeline.propagate(&request, &CancelToken::new()).await.unwrap();

    let record_key = fx.record_key("midterm", "alice");
    let record = fx.store.get(&record_key).await.unwrap().unwrap();
    let lowered = record.with_revision_marker(Some("abc1234".to_string()));
    fx.store.put(&record_key, lowered).await.unwrap();

    let rerun = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(rerun.propagated(), 0);
}

#[tokio::test]
async fn test_superseded_revisions_are_reported_not_propagated() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "aaaaaaa", 9).graded(40.0));
    fx.submit(submission("alice", "bbbbbbb", 12).graded(80.0));
    fx.submit(submission("bob", "ccccccc", 10).graded(70.0));

    let report = fx
        .pipeline()
        .propagate(&PropagationRequest::new("midterm"), &CancelToken::new())
        .await
        .unwrap();
    let outcomes: Vec<(&str, &str, &str)> = report
        .submissions
        .iter()
        .map(|s| (s.student.as_str(), s.revision.as_str(), s.outcome.as_str()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("alice", "bbbbbbb", "propagated"),
            ("alice", "aaaaaaa", "superseded"),
            ("bob", "ccccccc", "propagated"),
        ]
    );
    assert_eq!(fx.lms.grade_for("alice").unwrap().score, 80.0);
    assert_eq!(fx.lms.grades().len(), 2);
}

#[tokio::test]
async fn test_older_revision_than_recorded_is_stale() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "bbbbbbb", 12).graded(80.0));
    let request = PropagationRequest::new("midterm");
    fx.pipeline()
        .propagate(&request, &CancelToken::new())
        .await
        .unwrap();

    // another view of the platform that only knows an older revision
    let rewound = Arc::new(FakeHostingPlatform::new());
    rewound.insert_assignment(
        &FakeHostingPlatform::classroom_id(ORG, "CS101"),
        RemoteAssignment {
            id: fx.assignment_id.clone(),
            title: "Midterm".to_string(),
            description: None,
            due_date: None,
            points: Some(100),
            owner: Some("CS101".to_string()),
            acceptance_url: None,
        },
    );
    rewound.add_submission(&fx.assignment_id, submission("alice", "aaaaaaa", 9).graded(40.0));
    let pipeline = GradePipeline::new(rewound, fx.lms.clone(), fx.store.clone(), config());

    let report = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(
        report.current_for("alice").unwrap().outcome,
        SubmissionOutcome::Stale
    );
    assert_eq!(fx.lms.grades().len(), 1);
}

#[tokio::test]
async fn test_ungraded_submission_is_skipped() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "abc1234", 9));

    let report = fx
        .pipeline()
        .propagate(&PropagationRequest::new("midterm"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.current_for("alice").unwrap().outcome,
        SubmissionOutcome::Skipped {
            reason: "ungraded".to_string()
        }
    );
    assert!(report.is_success());
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 0);
}

#[tokio::test]
async fn test_unparsable_marker_is_flagged_non_idempotent() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "main", 9).graded(70.0));
    let pipeline = fx.pipeline();
    let request = PropagationRequest::new("midterm");

    let first = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    let alice = first.current_for("alice").unwrap();
    assert!(alice.non_idempotent);
    assert_eq!(alice.outcome, SubmissionOutcome::Propagated { score: 70.0 });

    let second = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(second.propagated(), 1);
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 2);
}

#[tokio::test]
async fn test_lms_rejection_keeps_previous_marker() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("bob", "aaaaaaa", 9).graded(50.0));
    let pipeline = fx.pipeline();
    let request = PropagationRequest::new("midterm");
    pipeline.propagate(&request, &CancelToken::new()).await.unwrap();

    fx.submit(submission("bob", "bbbbbbb", 12).graded(75.0));
    fx.lms
        .reject_student("bob", AdapterError::Rejected("not enrolled".to_string()));
    let report = pipeline.propagate(&request, &CancelToken::new()).await.unwrap();
    assert!(matches!(
        report.current_for("bob").unwrap().outcome,
        SubmissionOutcome::Failed { ref category, .. } if category == "validation"
    ));

    let record = fx
        .store
        .get(&fx.record_key("midterm", "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.revision_marker.as_deref(), Some("aaaaaaa"));
    assert!(record.last_error.as_deref().unwrap().contains("not enrolled"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_lms_failures_are_retried() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "abc1234", 9).graded(85.0));
    fx.lms
        .fail_next(Op::UpsertGrade, AdapterError::Timeout("gateway".to_string()));

    let report = fx
        .pipeline()
        .propagate(&PropagationRequest::new("midterm"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.propagated(), 1);
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 2);
}

#[tokio::test]
async fn test_student_filter() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "abc1234", 9).graded(85.0));
    fx.submit(submission("bob", "def5678", 10).graded(60.0));

    let request = PropagationRequest::new("midterm").for_student(Some("Bob".to_string()));
    let report = fx
        .pipeline()
        .propagate(&request, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.submissions.len(), 1);
    assert_eq!(report.submissions[0].student, "bob");
    assert!(fx.lms.grade_for("alice").is_none());
}

#[tokio::test]
async fn test_assignment_resolution() {
    let fx = Fixture::new("Midterm").await;
    let engine = ReconciliationEngine::new(fx.hosting.clone(), fx.store.clone(), config());
    let cancel = CancelToken::new();
    engine
        .reconcile_classroom(&ClassroomSpec::new(ORG, "CS202", "Systems"), &cancel)
        .await
        .unwrap();
    engine
        .reconcile_assignment(&AssignmentSpec::new(ORG, "CS202", "Midterm"), &cancel)
        .await
        .unwrap();
    let pipeline = fx.pipeline();

    let err = pipeline
        .propagate(&PropagationRequest::new("midterm"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::Validation(ref e) if e.to_string().contains("ambiguous")));

    let scoped = PropagationRequest::new("midterm").scoped(None, Some("cs202".to_string()));
    let report = pipeline.propagate(&scoped, &cancel).await.unwrap();
    assert_eq!(report.assignment, "assignment/lmsh-test/CS202/midterm");

    // the remote id works too
    let by_remote = PropagationRequest::new(fx.assignment_id.clone());
    let report = pipeline.propagate(&by_remote, &cancel).await.unwrap();
    assert_eq!(report.assignment, "assignment/lmsh-test/CS101/midterm");

    let err = pipeline
        .propagate(&PropagationRequest::new("final"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::NotFound(_)));
    assert_eq!(fx.hosting.calls(Op::ListSubmissions), 2);
}

#[tokio::test]
async fn test_cancelled_propagation_lists_nothing() {
    let fx = Fixture::new("Midterm").await;
    fx.submit(submission("alice", "abc1234", 9).graded(85.0));
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = fx
        .pipeline()
        .propagate(&PropagationRequest::new("midterm"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::Cancelled));
    assert_eq!(fx.hosting.calls(Op::ListSubmissions), 0);
    assert_eq!(fx.lms.calls(Op::UpsertGrade), 0);
}
