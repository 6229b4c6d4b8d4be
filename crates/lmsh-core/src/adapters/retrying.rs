//! Retrying decorators for adapters.
//!
//! Wrap any `HostingPlatform` or `Lms` so that transient failures are retried
//! according to a `RetryPolicy` before the engine ever sees them.

use std::sync::Arc;

use async_trait::async_trait;
use lmsh_state::EntityKey;

use super::{
    AdapterResult, GradeUpdate, HostingPlatform, Lms, RemoteAssignment, RemoteClassroom,
};
use crate::domain::{AssignmentChanges, AssignmentSpec, ClassroomChanges, ClassroomSpec, Submission};
use crate::retry::RetryPolicy;

/// `HostingPlatform` decorator applying a retry policy to every call.
pub struct RetryingHosting {
    inner: Arc<dyn HostingPlatform>,
    policy: RetryPolicy,
}

impl RetryingHosting {
    pub fn new(inner: Arc<dyn HostingPlatform>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl HostingPlatform for RetryingHosting {
    async fn find_classroom(&self, key: &EntityKey) -> AdapterResult<Option<RemoteClassroom>> {
        self.policy
            .execute("find_classroom", || self.inner.find_classroom(key))
            .await
    }

    async fn create_classroom(&self, spec: &ClassroomSpec) -> AdapterResult<RemoteClassroom> {
        self.policy
            .execute("create_classroom", || self.inner.create_classroom(spec))
            .await
    }

    async fn update_classroom(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &ClassroomChanges,
    ) -> AdapterResult<RemoteClassroom> {
        self.policy
            .execute("update_classroom", || {
                self.inner.update_classroom(key, remote_id, changes)
            })
            .await
    }

    async fn find_assignment(&self, key: &EntityKey) -> AdapterResult<Option<RemoteAssignment>> {
        self.policy
            .execute("find_assignment", || self.inner.find_assignment(key))
            .await
    }

    async fn create_assignment(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
    ) -> AdapterResult<RemoteAssignment> {
        self.policy
            .execute("create_assignment", || {
                self.inner.create_assignment(classroom_id, spec)
            })
            .await
    }

    async fn update_assignment(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &AssignmentChanges,
    ) -> AdapterResult<RemoteAssignment> {
        self.policy
            .execute("update_assignment", || {
                self.inner.update_assignment(key, remote_id, changes)
            })
            .await
    }

    async fn link_assignment(
        &self,
        classroom_id: &str,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<()> {
        self.policy
            .execute("link_assignment", || {
                self.inner.link_assignment(classroom_id, key, remote_id)
            })
            .await
    }

    async fn list_submissions(
        &self,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<Vec<Submission>> {
        self.policy
            .execute("list_submissions", || {
                self.inner.list_submissions(key, remote_id)
            })
            .await
    }
}

/// `Lms` decorator applying a retry policy to every call.
pub struct RetryingLms {
    inner: Arc<dyn Lms>,
    policy: RetryPolicy,
}

impl RetryingLms {
    pub fn new(inner: Arc<dyn Lms>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Lms for RetryingLms {
    async fn upsert_grade(&self, grade: &GradeUpdate) -> AdapterResult<()> {
        self.policy
            .execute("upsert_grade", || self.inner.upsert_grade(grade))
            .await
    }

    async fn list_roster(&self, course_code: &str) -> AdapterResult<Vec<String>> {
        self.policy
            .execute("list_roster", || self.inner.list_roster(course_code))
            .await
    }
}
