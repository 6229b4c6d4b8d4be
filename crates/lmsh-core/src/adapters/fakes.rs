//! In-memory fakes for the adapter traits (testing only)
//!
//! `FakeHostingPlatform` and `FakeLms` behave like well-mannered remotes:
//! deterministic names, `AlreadyExists` on duplicate creates, `NotFound` for
//! unknown ids. Every call is counted per [`Op`] and failures can be queued
//! per operation so tests can script rate limits and outages.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lmsh_state::EntityKey;

use super::*;

/// Adapter operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FindClassroom,
    CreateClassroom,
    UpdateClassroom,
    FindAssignment,
    CreateAssignment,
    UpdateAssignment,
    LinkAssignment,
    ListSubmissions,
    UpsertGrade,
    ListRoster,
}

impl Op {
    /// Operations that change remote state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::CreateClassroom
                | Op::UpdateClassroom
                | Op::CreateAssignment
                | Op::UpdateAssignment
                | Op::LinkAssignment
                | Op::UpsertGrade
        )
    }
}

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Call counters and queued failures shared by both fakes.
#[derive(Debug, Default)]
struct Script {
    calls: Mutex<HashMap<Op, usize>>,
    failures: Mutex<HashMap<Op, VecDeque<AdapterError>>>,
    latency: Mutex<Option<Duration>>,
}

impl Script {
    /// Count the call, wait out any latency, then pop a queued failure.
    async fn enter(&self, op: Op) -> AdapterResult<()> {
        *relock(&self.calls).entry(op).or_default() += 1;
        let latency = *relock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match relock(&self.failures).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn calls(&self, op: Op) -> usize {
        relock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    fn total(&self, filter: impl Fn(&Op) -> bool) -> usize {
        relock(&self.calls)
            .iter()
            .filter(|(op, _)| filter(op))
            .map(|(_, n)| n)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// FakeHostingPlatform
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HostingState {
    classrooms: BTreeMap<String, RemoteClassroom>,
    /// assignment id → (classroom id, assignment)
    assignments: BTreeMap<String, (String, RemoteAssignment)>,
    /// assignment ids attached to their classroom
    linked: BTreeSet<String>,
    /// assignment id → submissions
    submissions: BTreeMap<String, Vec<Submission>>,
}

/// In-memory hosting platform.
#[derive(Debug, Default)]
pub struct FakeHostingPlatform {
    state: Mutex<HostingState>,
    script: Script,
}

impl FakeHostingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic remote id of a classroom.
    pub fn classroom_id(org: &str, course_code: &str) -> String {
        format!("{org}/{course_code}").to_ascii_lowercase()
    }

    /// Deterministic remote id of an assignment.
    pub fn assignment_id(org: &str, course_code: &str, key: &str) -> String {
        format!("{org}/{course_code}-{key}").to_ascii_lowercase()
    }

    /// Delay every call by `latency` (widens race windows in tests).
    pub fn set_latency(&self, latency: Duration) {
        *relock(&self.script.latency) = Some(latency);
    }

    /// Make the next call to `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: Op, err: AdapterError) {
        relock(&self.script.failures)
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.script.calls(op)
    }

    pub fn total_calls(&self) -> usize {
        self.script.total(|_| true)
    }

    /// Creates and updates issued so far (including failed ones).
    pub fn mutating_calls(&self) -> usize {
        self.script.total(Op::is_mutation)
    }

    pub fn insert_classroom(&self, classroom: RemoteClassroom) {
        relock(&self.state)
            .classrooms
            .insert(classroom.id.clone(), classroom);
    }

    /// Seed an assignment that exists remotely but was never attached to its
    /// classroom, as after an interrupted create.
    pub fn insert_assignment(&self, classroom_id: &str, assignment: RemoteAssignment) {
        relock(&self.state).assignments.insert(
            assignment.id.clone(),
            (classroom_id.to_string(), assignment),
        );
    }

    pub fn add_submission(&self, assignment_id: &str, submission: Submission) {
        relock(&self.state)
            .submissions
            .entry(assignment_id.to_string())
            .or_default()
            .push(submission);
    }

    pub fn classroom(&self, id: &str) -> Option<RemoteClassroom> {
        relock(&self.state).classrooms.get(id).cloned()
    }

    pub fn assignment(&self, id: &str) -> Option<RemoteAssignment> {
        relock(&self.state)
            .assignments
            .get(id)
            .map(|(_, a)| a.clone())
    }

    pub fn is_linked(&self, assignment_id: &str) -> bool {
        relock(&self.state).linked.contains(assignment_id)
    }

    pub fn classroom_count(&self) -> usize {
        relock(&self.state).classrooms.len()
    }

    pub fn assignment_count(&self) -> usize {
        relock(&self.state).assignments.len()
    }
}

#[async_trait]
impl HostingPlatform for FakeHostingPlatform {
    async fn find_classroom(&self, key: &EntityKey) -> AdapterResult<Option<RemoteClassroom>> {
        self.script.enter(Op::FindClassroom).await?;
        let id = Self::classroom_id(key.org(), key.course_code());
        Ok(self.classroom(&id))
    }

    async fn create_classroom(&self, spec: &ClassroomSpec) -> AdapterResult<RemoteClassroom> {
        self.script.enter(Op::CreateClassroom).await?;
        let id = Self::classroom_id(&spec.org, &spec.course_code);
        let mut state = relock(&self.state);
        if state.classrooms.contains_key(&id) {
            return Err(AdapterError::AlreadyExists(format!("classroom {id}")));
        }
        let classroom = RemoteClassroom {
            id: id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            owner: Some(spec.course_code.clone()),
            roster: spec.roster.clone(),
            url: Some(format!("https://hosting.test/{id}")),
        };
        state.classrooms.insert(id, classroom.clone());
        Ok(classroom)
    }

    async fn update_classroom(
        &self,
        _key: &EntityKey,
        remote_id: &str,
        changes: &ClassroomChanges,
    ) -> AdapterResult<RemoteClassroom> {
        self.script.enter(Op::UpdateClassroom).await?;
        let mut state = relock(&self.state);
        let classroom = state
            .classrooms
            .get_mut(remote_id)
            .ok_or_else(|| AdapterError::NotFound(format!("classroom {remote_id}")))?;
        if let Some(name) = &changes.name {
            classroom.name = name.clone();
        }
        if let Some(description) = &changes.description {
            classroom.description = description.clone();
        }
        classroom.roster.extend(changes.add_members.iter().cloned());
        Ok(classroom.clone())
    }

    async fn find_assignment(&self, key: &EntityKey) -> AdapterResult<Option<RemoteAssignment>> {
        self.script.enter(Op::FindAssignment).await?;
        let Some(assignment) = key.assignment_key() else {
            return Err(AdapterError::Rejected(format!("{key} is not an assignment")));
        };
        let id = Self::assignment_id(key.org(), key.course_code(), assignment);
        Ok(self.assignment(&id))
    }

    async fn create_assignment(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
    ) -> AdapterResult<RemoteAssignment> {
        self.script.enter(Op::CreateAssignment).await?;
        let id = Self::assignment_id(&spec.org, &spec.course_code, &spec.key);
        let mut state = relock(&self.state);
        if !state.classrooms.contains_key(classroom_id) {
            return Err(AdapterError::NotFound(format!("classroom {classroom_id}")));
        }
        if state.assignments.contains_key(&id) {
            return Err(AdapterError::AlreadyExists(format!("assignment {id}")));
        }
        let assignment = RemoteAssignment {
            id: id.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            due_date: spec.due_date,
            points: spec.points,
            owner: Some(spec.course_code.clone()),
            acceptance_url: Some(format!("https://hosting.test/{id}/accept")),
        };
        state.linked.insert(id.clone());
        state
            .assignments
            .insert(id, (classroom_id.to_string(), assignment.clone()));
        Ok(assignment)
    }

    async fn update_assignment(
        &self,
        _key: &EntityKey,
        remote_id: &str,
        changes: &AssignmentChanges,
    ) -> AdapterResult<RemoteAssignment> {
        self.script.enter(Op::UpdateAssignment).await?;
        let mut state = relock(&self.state);
        let (_, assignment) = state
            .assignments
            .get_mut(remote_id)
            .ok_or_else(|| AdapterError::NotFound(format!("assignment {remote_id}")))?;
        if let Some(title) = &changes.title {
            assignment.title = title.clone();
        }
        if let Some(description) = &changes.description {
            assignment.description = description.clone();
        }
        if let Some(due_date) = changes.due_date {
            assignment.due_date = due_date;
        }
        if let Some(points) = changes.points {
            assignment.points = Some(points);
        }
        Ok(assignment.clone())
    }

    async fn link_assignment(
        &self,
        classroom_id: &str,
        _key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<()> {
        self.script.enter(Op::LinkAssignment).await?;
        let mut state = relock(&self.state);
        if !state.classrooms.contains_key(classroom_id) {
            return Err(AdapterError::NotFound(format!("classroom {classroom_id}")));
        }
        let (parent, _) = state
            .assignments
            .get_mut(remote_id)
            .ok_or_else(|| AdapterError::NotFound(format!("assignment {remote_id}")))?;
        *parent = classroom_id.to_string();
        state.linked.insert(remote_id.to_string());
        Ok(())
    }

    async fn list_submissions(
        &self,
        _key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<Vec<Submission>> {
        self.script.enter(Op::ListSubmissions).await?;
        let state = relock(&self.state);
        if !state.assignments.contains_key(remote_id) {
            return Err(AdapterError::NotFound(format!("assignment {remote_id}")));
        }
        Ok(state.submissions.get(remote_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// FakeLms
// ---------------------------------------------------------------------------

/// In-memory LMS recording every grade write.
#[derive(Debug, Default)]
pub struct FakeLms {
    grades: Mutex<Vec<GradeUpdate>>,
    rosters: Mutex<HashMap<String, Vec<String>>>,
    rejected_students: Mutex<HashMap<String, AdapterError>>,
    script: Script,
}

impl FakeLms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_roster<I, S>(&self, course_code: &str, students: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        relock(&self.rosters).insert(
            course_code.to_string(),
            students.into_iter().map(Into::into).collect(),
        );
    }

    pub fn fail_next(&self, op: Op, err: AdapterError) {
        relock(&self.script.failures)
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Reject every grade write for `student` with `err`.
    pub fn reject_student(&self, student: &str, err: AdapterError) {
        relock(&self.rejected_students).insert(student.to_string(), err);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.script.calls(op)
    }

    /// Every successful grade write, in order.
    pub fn grades(&self) -> Vec<GradeUpdate> {
        relock(&self.grades).clone()
    }

    /// Latest grade written for `student`.
    pub fn grade_for(&self, student: &str) -> Option<GradeUpdate> {
        relock(&self.grades)
            .iter()
            .rev()
            .find(|g| g.student == student)
            .cloned()
    }
}

#[async_trait]
impl Lms for FakeLms {
    async fn upsert_grade(&self, grade: &GradeUpdate) -> AdapterResult<()> {
        self.script.enter(Op::UpsertGrade).await?;
        if let Some(err) = relock(&self.rejected_students).get(&grade.student) {
            return Err(err.clone());
        }
        relock(&self.grades).push(grade.clone());
        Ok(())
    }

    async fn list_roster(&self, course_code: &str) -> AdapterResult<Vec<String>> {
        self.script.enter(Op::ListRoster).await?;
        relock(&self.rosters)
            .get(course_code)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("course {course_code}")))
    }
}
