//! Reconciliation engine tests against the in-memory hosting fake and
//! in-memory state store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use lmsh_core::adapters::fakes::{FakeHostingPlatform, Op};
use lmsh_core::{
    AdapterError, AdapterResult, AssignmentChanges, AssignmentSpec, CancelToken,
    ClassroomChanges, ClassroomSpec, EngineConfig, EntityKey, HostingPlatform, ItemOutcome,
    LmshError, Manifest, ReconcileAction, ReconciliationEngine, RemoteAssignment,
    RemoteClassroom, RetryPolicy, StateStore, Submission,
};
use lmsh_state::fakes::MemoryStateStore;

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

fn engine(hosting: &Arc<FakeHostingPlatform>, store: &Arc<MemoryStateStore>) -> ReconciliationEngine {
    ReconciliationEngine::new(hosting.clone(), store.clone(), config())
}

fn intro() -> ClassroomSpec {
    ClassroomSpec::new("lmsh-test", "CS101", "Intro to CS")
        .with_description(Some("Fall term".to_string()))
        .with_students(["octocat", "hubot"])
}

fn midterm() -> AssignmentSpec {
    AssignmentSpec::new("lmsh-test", "CS101", "Midterm")
        .with_due_date(NaiveDate::from_ymd_opt(2024, 10, 15))
        .with_points(Some(100))
}

#[tokio::test]
async fn test_create_then_rerun_is_a_noop() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    let first = engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    assert_eq!(first.action, ReconcileAction::Created);
    assert_eq!(first.remote_id, "lmsh-test/cs101");
    assert_eq!(first.remote_url.as_deref(), Some("https://hosting.test/lmsh-test/cs101"));
    assert_eq!(first.revision, 1);
    assert_eq!(hosting.calls(Op::CreateClassroom), 1);

    let calls_before = hosting.total_calls();
    let second = engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    assert_eq!(second.action, ReconcileAction::Unchanged);
    assert_eq!(second.remote_id, first.remote_id);
    assert_eq!(second.revision, 1);
    assert_eq!(hosting.total_calls(), calls_before, "unchanged state must not call the remote");
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_assignment_rerun_is_a_noop() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    let created = engine.reconcile_assignment(&midterm(), &cancel).await.unwrap();
    assert_eq!(created.action, ReconcileAction::Created);
    assert_eq!(created.remote_id, "lmsh-test/cs101-midterm");
    assert_eq!(
        created.remote_url.as_deref(),
        Some("https://hosting.test/lmsh-test/cs101-midterm/accept")
    );

    let mutations = hosting.mutating_calls();
    let again = engine.reconcile_assignment(&midterm(), &cancel).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert_eq!(hosting.mutating_calls(), mutations);
}

#[tokio::test]
async fn test_default_points_are_applied() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    let spec = AssignmentSpec::new("lmsh-test", "CS101", "Lab 1");
    engine.reconcile_assignment(&spec, &cancel).await.unwrap();

    let remote = hosting
        .assignment(&FakeHostingPlatform::assignment_id("lmsh-test", "CS101", "lab-1"))
        .unwrap();
    assert_eq!(remote.points, Some(100));

    // declaring the default explicitly is the same desired state
    let explicit = spec.clone().with_points(Some(100));
    let result = engine.reconcile_assignment(&explicit, &cancel).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Unchanged);
}

#[tokio::test]
async fn test_course_code_case_names_one_classroom() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    let mut lower = intro();
    lower.course_code = "cs101".to_string();
    let again = engine.reconcile_classroom(&lower, &cancel).await.unwrap();
    assert_eq!(again.action, ReconcileAction::Unchanged);
    assert_eq!(store.list(None).await.unwrap().len(), 1);
    assert_eq!(hosting.calls(Op::CreateClassroom), 1);

    let assignment = AssignmentSpec::new("lmsh-test", "cs101", "Midterm");
    let result = engine.reconcile_assignment(&assignment, &cancel).await.unwrap();
    assert_eq!(result.key.storage_id(), "assignment/lmsh-test/CS101/midterm");
}

#[tokio::test]
async fn test_adopts_marked_remote_classroom() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = intro();
    hosting.insert_classroom(RemoteClassroom {
        id: FakeHostingPlatform::classroom_id("lmsh-test", "CS101"),
        name: spec.name.clone(),
        description: spec.description.clone(),
        owner: Some("CS101".to_string()),
        roster: spec.roster.clone(),
        url: None,
    });

    let result = engine(&hosting, &store)
        .reconcile_classroom(&spec, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.action, ReconcileAction::Adopted);
    assert!(result.changed.is_empty());
    assert_eq!(hosting.calls(Op::CreateClassroom), 0);
    assert_eq!(hosting.mutating_calls(), 0);
    assert_eq!(store.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_adoption_applies_differences() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let id = FakeHostingPlatform::classroom_id("lmsh-test", "CS101");
    hosting.insert_classroom(RemoteClassroom {
        id: id.clone(),
        name: "Old name".to_string(),
        description: Some("Fall term".to_string()),
        owner: Some("cs101".to_string()),
        roster: BTreeSet::from(["octocat".to_string()]),
        url: Some(format!("https://hosting.test/{id}")),
    });

    let result = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.action, ReconcileAction::Adopted);
    assert_eq!(result.changed, vec!["name", "roster"]);

    let remote = hosting.classroom(&id).unwrap();
    assert_eq!(remote.name, "Intro to CS");
    assert!(remote.roster.contains("hubot"));
    assert_eq!(hosting.calls(Op::UpdateClassroom), 1);
}

#[tokio::test]
async fn test_unmarked_remote_is_a_conflict() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    hosting.insert_classroom(RemoteClassroom {
        id: FakeHostingPlatform::classroom_id("lmsh-test", "CS101"),
        name: "Intro to CS".to_string(),
        description: None,
        owner: None,
        roster: BTreeSet::new(),
        url: None,
    });

    let err = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::Conflict(_)), "got {err:?}");
    assert_eq!(hosting.mutating_calls(), 0);
    assert!(store.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_foreign_owner_is_a_conflict() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();
    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();

    hosting.insert_assignment(
        &FakeHostingPlatform::classroom_id("lmsh-test", "CS101"),
        RemoteAssignment {
            id: FakeHostingPlatform::assignment_id("lmsh-test", "CS101", "midterm"),
            title: "Midterm".to_string(),
            description: None,
            due_date: None,
            points: Some(100),
            owner: Some("CS202".to_string()),
            acceptance_url: None,
        },
    );

    let err = engine.reconcile_assignment(&midterm(), &cancel).await.unwrap_err();
    assert!(matches!(err, LmshError::Conflict(ref m) if m.contains("CS202")));
    assert_eq!(hosting.calls(Op::CreateAssignment), 0);
}

fn detached_midterm(owner: &str) -> RemoteAssignment {
    RemoteAssignment {
        id: FakeHostingPlatform::assignment_id("lmsh-test", "CS101", "midterm"),
        title: "Midterm".to_string(),
        description: None,
        due_date: NaiveDate::from_ymd_opt(2024, 10, 15),
        points: Some(100),
        owner: Some(owner.to_string()),
        acceptance_url: None,
    }
}

#[tokio::test]
async fn test_adopted_assignment_is_linked_to_classroom() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();
    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();

    // created remotely, but the run stopped before attaching it
    let classroom_id = FakeHostingPlatform::classroom_id("lmsh-test", "CS101");
    let remote = detached_midterm("CS101");
    hosting.insert_assignment(&classroom_id, remote.clone());
    assert!(!hosting.is_linked(&remote.id));

    let result = engine.reconcile_assignment(&midterm(), &cancel).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Adopted);
    assert!(result.changed.is_empty());
    assert!(hosting.is_linked(&remote.id));
    assert_eq!(hosting.calls(Op::LinkAssignment), 1);
    assert_eq!(hosting.calls(Op::CreateAssignment), 0);
}

#[tokio::test]
async fn test_assignment_update_reasserts_link() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();
    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    engine.reconcile_assignment(&midterm(), &cancel).await.unwrap();
    assert_eq!(hosting.calls(Op::LinkAssignment), 0);

    let moved = midterm().with_due_date(NaiveDate::from_ymd_opt(2024, 10, 22));
    let result = engine.reconcile_assignment(&moved, &cancel).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Updated);
    assert_eq!(hosting.calls(Op::LinkAssignment), 1);
}

#[tokio::test]
async fn test_assignment_before_classroom_fails_without_remote_calls() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let spec = AssignmentSpec::new("lmsh-test", "CS101-2024", "Midterm");

    let err = engine(&hosting, &store)
        .reconcile_assignment(&spec, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::NotFound(ref m) if m.contains("CS101-2024")));
    assert_eq!(hosting.total_calls(), 0);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn test_validation_failures_make_no_remote_calls() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    let bad_course = ClassroomSpec::new("lmsh-test", "CS 101", "Intro");
    let err = engine.reconcile_classroom(&bad_course, &cancel).await.unwrap_err();
    assert!(matches!(err, LmshError::Validation(_)));

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    let calls = hosting.total_calls();
    let zero_points = midterm().with_points(Some(0));
    let err = engine.reconcile_assignment(&zero_points, &cancel).await.unwrap_err();
    assert!(matches!(err, LmshError::Validation(_)));
    assert_eq!(hosting.total_calls(), calls);
}

#[tokio::test]
async fn test_update_sends_only_changed_fields() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    engine.reconcile_assignment(&midterm(), &cancel).await.unwrap();

    let moved = midterm().with_due_date(NaiveDate::from_ymd_opt(2024, 10, 22));
    let result = engine.reconcile_assignment(&moved, &cancel).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Updated);
    assert_eq!(result.changed, vec!["due_date"]);
    assert_eq!(result.revision, 2);
    assert_eq!(hosting.calls(Op::UpdateAssignment), 1);

    let remote = hosting
        .assignment(&FakeHostingPlatform::assignment_id("lmsh-test", "CS101", "midterm"))
        .unwrap();
    assert_eq!(remote.due_date, NaiveDate::from_ymd_opt(2024, 10, 22));
    assert_eq!(remote.title, "Midterm");
}

#[tokio::test]
async fn test_roster_is_add_only() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    let smaller = ClassroomSpec::new("lmsh-test", "CS101", "Intro to CS")
        .with_description(Some("Fall term".to_string()))
        .with_students(["octocat", "monalisa"]);
    let result = engine.reconcile_classroom(&smaller, &cancel).await.unwrap();
    assert_eq!(result.changed, vec!["roster"]);

    let remote = hosting
        .classroom(&FakeHostingPlatform::classroom_id("lmsh-test", "CS101"))
        .unwrap();
    let roster: Vec<&str> = remote.roster.iter().map(String::as_str).collect();
    assert_eq!(roster, vec!["hubot", "monalisa", "octocat"]);
}

#[tokio::test]
async fn test_failed_update_records_last_error() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();

    let created = engine.reconcile_classroom(&intro(), &cancel).await.unwrap();
    hosting.fail_next(
        Op::UpdateClassroom,
        AdapterError::Rejected("name too long".to_string()),
    );

    let renamed = ClassroomSpec {
        name: "Introduction to Computer Science".to_string(),
        ..intro()
    };
    let err = engine.reconcile_classroom(&renamed, &cancel).await.unwrap_err();
    assert!(matches!(err, LmshError::Validation(_)));

    let record = store.get(&created.key).await.unwrap().unwrap();
    assert!(record.last_error.as_deref().unwrap().contains("name too long"));
    assert_eq!(record.applied["name"], "Intro to CS");

    // the next attempt succeeds and clears the error
    let result = engine.reconcile_classroom(&renamed, &cancel).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Updated);
    let record = store.get(&created.key).await.unwrap().unwrap();
    assert!(record.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    hosting.fail_next(
        Op::CreateClassroom,
        AdapterError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        },
    );
    hosting.fail_next(Op::CreateClassroom, AdapterError::Timeout("slow".to_string()));

    let result = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.action, ReconcileAction::Created);
    assert_eq!(hosting.calls(Op::CreateClassroom), 3);
    assert_eq!(hosting.classroom_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_leave_no_record() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    for _ in 0..3 {
        hosting.fail_next(Op::CreateClassroom, AdapterError::Unavailable("503".to_string()));
    }

    let err = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &CancelToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(hosting.calls(Op::CreateClassroom), 3);
    assert!(store.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_reconciles_of_one_key_create_once() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let cancel = CancelToken::new();
    let spec = intro();

    let results = join_all((0..4).map(|_| engine.reconcile_classroom(&spec, &cancel))).await;
    let actions: Vec<ReconcileAction> = results.into_iter().map(|r| r.unwrap().action).collect();
    assert_eq!(
        actions.iter().filter(|a| **a == ReconcileAction::Created).count(),
        1
    );
    assert_eq!(hosting.calls(Op::CreateClassroom), 1);
    assert_eq!(hosting.classroom_count(), 1);
}

#[tokio::test]
async fn test_engines_sharing_a_store_converge() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    hosting.set_latency(Duration::from_millis(20));
    let store = Arc::new(MemoryStateStore::new());
    let a = engine(&hosting, &store);
    let b = engine(&hosting, &store);
    let cancel = CancelToken::new();
    let spec = intro();

    let (ra, rb) = tokio::join!(
        a.reconcile_classroom(&spec, &cancel),
        b.reconcile_classroom(&spec, &cancel)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.remote_id, rb.remote_id);
    assert_eq!(hosting.classroom_count(), 1);

    let records = store.list(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].remote_id, ra.remote_id);
}

/// Cancels the run right after the remote create succeeds.
struct CancelAfterCreate {
    inner: Arc<FakeHostingPlatform>,
    cancel: CancelToken,
}

#[async_trait]
impl HostingPlatform for CancelAfterCreate {
    async fn find_classroom(&self, key: &EntityKey) -> AdapterResult<Option<RemoteClassroom>> {
        self.inner.find_classroom(key).await
    }

    async fn create_classroom(&self, spec: &ClassroomSpec) -> AdapterResult<RemoteClassroom> {
        let created = self.inner.create_classroom(spec).await;
        self.cancel.cancel();
        created
    }

    async fn update_classroom(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &ClassroomChanges,
    ) -> AdapterResult<RemoteClassroom> {
        self.inner.update_classroom(key, remote_id, changes).await
    }

    async fn find_assignment(&self, key: &EntityKey) -> AdapterResult<Option<RemoteAssignment>> {
        self.inner.find_assignment(key).await
    }

    async fn create_assignment(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
    ) -> AdapterResult<RemoteAssignment> {
        self.inner.create_assignment(classroom_id, spec).await
    }

    async fn update_assignment(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &AssignmentChanges,
    ) -> AdapterResult<RemoteAssignment> {
        self.inner.update_assignment(key, remote_id, changes).await
    }

    async fn link_assignment(
        &self,
        classroom_id: &str,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<()> {
        self.inner.link_assignment(classroom_id, key, remote_id).await
    }

    async fn list_submissions(
        &self,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<Vec<Submission>> {
        self.inner.list_submissions(key, remote_id).await
    }
}

#[tokio::test]
async fn test_cancelled_after_create_is_adopted_next_run() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let cancel = CancelToken::new();
    let cancelling = Arc::new(CancelAfterCreate {
        inner: hosting.clone(),
        cancel: cancel.clone(),
    });

    let interrupted = ReconciliationEngine::new(cancelling, store.clone(), config());
    let err = interrupted
        .reconcile_classroom(&intro(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::Cancelled));
    assert_eq!(hosting.classroom_count(), 1);
    assert!(store.list(None).await.unwrap().is_empty());

    let result = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.action, ReconcileAction::Adopted);
    assert_eq!(hosting.calls(Op::CreateClassroom), 1);
    assert_eq!(hosting.classroom_count(), 1);
}

#[tokio::test]
async fn test_cancelled_token_stops_before_remote_calls() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = engine(&hosting, &store)
        .reconcile_classroom(&intro(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LmshError::Cancelled));
    assert_eq!(hosting.total_calls(), 0);
}

#[tokio::test]
async fn test_plan_skips_assignments_when_classroom_fails() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    hosting.fail_next(
        Op::CreateClassroom,
        AdapterError::Unauthorized("bad token".to_string()),
    );

    let report = engine(&hosting, &store)
        .reconcile_plan(&intro(), &[midterm()], &CancelToken::new())
        .await;
    assert!(!report.is_success());
    assert!(matches!(
        report.classroom.outcome,
        ItemOutcome::Failed { ref category, .. } if category == "unauthorized"
    ));
    assert!(matches!(report.assignments[0].outcome, ItemOutcome::Skipped { .. }));
    assert_eq!(hosting.calls(Op::FindAssignment), 0);
}

#[tokio::test]
async fn test_plan_continues_after_assignment_failure() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    hosting.fail_next(
        Op::CreateAssignment,
        AdapterError::Rejected("bad template".to_string()),
    );
    let lab = AssignmentSpec::new("lmsh-test", "CS101", "Lab 1");

    let report = engine(&hosting, &store)
        .reconcile_plan(&intro(), &[midterm(), lab], &CancelToken::new())
        .await;
    assert!(report.assignments[0].is_failure());
    assert!(!report.assignments[1].is_failure());
    assert_eq!(hosting.assignment_count(), 1);
}

#[tokio::test]
async fn test_sync_manifest() {
    let hosting = Arc::new(FakeHostingPlatform::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine(&hosting, &store);
    let manifest = Manifest::from_json(
        r#"{
            "classrooms": [
                {
                    "org": "lmsh-test", "course_code": "CS101", "name": "Intro to CS",
                    "roster": ["octocat"],
                    "assignments": [
                        { "title": "Midterm", "due_date": "2024-10-15" },
                        { "title": "Final", "points": 200 }
                    ]
                },
                {
                    "org": "lmsh-test", "course_code": "CS202", "name": "Systems",
                    "assignments": [ { "title": "Lab 1: Shell" } ]
                }
            ]
        }"#,
    )
    .unwrap();

    let report = engine.sync(&manifest, &CancelToken::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.failures(), 0);
    assert_eq!(hosting.classroom_count(), 2);
    assert_eq!(hosting.assignment_count(), 3);
    assert_eq!(report.plans[1].assignments[0].key, "assignment/lmsh-test/CS202/lab-1-shell");

    let mutations = hosting.mutating_calls();
    let again = engine.sync(&manifest, &CancelToken::new()).await.unwrap();
    assert!(again.is_success());
    assert_eq!(hosting.mutating_calls(), mutations);
}
