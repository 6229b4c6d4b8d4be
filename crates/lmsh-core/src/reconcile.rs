//! Reconciliation engine
//!
//! Makes the hosting platform match declared classrooms and assignments:
//!
//! 1. validate the desired entity (no remote call on failure)
//! 2. snapshot + digest the desired configuration
//! 3. no record → adopt the remote entity carrying our ownership marker, or
//!    create it; then write the record with compare-and-swap
//! 4. record with the same digest → no-op, zero remote calls
//! 5. record with another digest → diff against the last applied snapshot,
//!    send only the changed fields, then swap the record
//!
//! A lost compare-and-swap re-reads and repeats the decision, up to
//! `EngineConfig::cas_budget` times. Nothing is ever deleted remotely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use lmsh_state::{ConfigDigest, EntityKey, ReconciliationRecord, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, HostingPlatform, Lms, RetryingHosting};
use crate::config::EngineConfig;
use crate::domain::{
    digest, AssignmentChanges, AssignmentSpec, ClassroomChanges, ClassroomSpec, LmshError,
    Result, ValidationError,
};
use crate::locks::{CancelToken, KeyLocks};
use crate::manifest::Manifest;
use crate::obs;

/// A desired classroom or assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Desired {
    Classroom(ClassroomSpec),
    Assignment(AssignmentSpec),
}

impl Desired {
    pub fn key(&self) -> EntityKey {
        match self {
            Desired::Classroom(spec) => spec.key(),
            Desired::Assignment(spec) => spec.key(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        match self {
            Desired::Classroom(spec) => spec.validate(),
            Desired::Assignment(spec) => spec.validate(),
        }
    }

    fn snapshot(&self) -> Result<(Value, ConfigDigest)> {
        match self {
            Desired::Classroom(spec) => digest::snapshot(spec),
            Desired::Assignment(spec) => digest::snapshot(spec),
        }
    }
}

/// What a reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Adopted,
    Updated,
    Unchanged,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Created => "created",
            ReconcileAction::Adopted => "adopted",
            ReconcileAction::Updated => "updated",
            ReconcileAction::Unchanged => "unchanged",
        }
    }
}

/// Outcome of reconciling one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub key: EntityKey,
    pub action: ReconcileAction,
    pub remote_id: String,
    /// Classroom URL or assignment acceptance link.
    pub remote_url: Option<String>,
    /// Fields sent to the remote in an update.
    pub changed: Vec<String>,
    /// Store revision of the record after this run.
    pub revision: u64,
}

impl ReconciliationResult {
    fn from_record(
        record: &ReconciliationRecord,
        action: ReconcileAction,
        changed: Vec<String>,
    ) -> Self {
        Self {
            key: record.key.clone(),
            action,
            remote_id: record.remote_id.clone(),
            remote_url: record.remote_url.clone(),
            changed,
            revision: record.revision,
        }
    }
}

/// Per-item status inside a batch report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Reconciled(ReconciliationResult),
    Failed { category: String, error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub key: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemReport {
    fn new(key: &EntityKey, result: Result<ReconciliationResult>) -> Self {
        let outcome = match result {
            Ok(result) => ItemOutcome::Reconciled(result),
            Err(err) => ItemOutcome::Failed {
                category: err.category().to_string(),
                error: err.to_string(),
            },
        };
        Self {
            key: key.storage_id(),
            outcome,
        }
    }

    fn skipped(key: &EntityKey, reason: impl Into<String>) -> Self {
        Self {
            key: key.storage_id(),
            outcome: ItemOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self.outcome, ItemOutcome::Reconciled(_))
    }
}

/// A classroom followed by its assignments, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub classroom: ItemReport,
    pub assignments: Vec<ItemReport>,
}

impl PlanReport {
    pub fn items(&self) -> impl Iterator<Item = &ItemReport> {
        std::iter::once(&self.classroom).chain(self.assignments.iter())
    }

    pub fn is_success(&self) -> bool {
        self.items().all(|item| !item.is_failure())
    }
}

/// Report for a whole manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub plans: Vec<PlanReport>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.plans.iter().all(PlanReport::is_success)
    }

    pub fn failures(&self) -> usize {
        self.plans
            .iter()
            .flat_map(PlanReport::items)
            .filter(|item| item.is_failure())
            .count()
    }
}

/// Remote entity found or created for a key without a record.
struct Provisioned {
    remote_id: String,
    remote_url: Option<String>,
    action: ReconcileAction,
    changed: Vec<String>,
}

fn owned(fields: Vec<&'static str>) -> Vec<String> {
    fields.into_iter().map(str::to_string).collect()
}

/// Diffs desired classrooms and assignments against recorded state and
/// applies the minimal set of remote operations.
pub struct ReconciliationEngine {
    hosting: Arc<dyn HostingPlatform>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    locks: KeyLocks,
}

impl ReconciliationEngine {
    /// The hosting adapter is wrapped in a `RetryingHosting` using
    /// `config.retry`.
    pub fn new(
        hosting: Arc<dyn HostingPlatform>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        let hosting: Arc<dyn HostingPlatform> =
            Arc::new(RetryingHosting::new(hosting, config.retry.clone()));
        Self {
            hosting,
            store,
            config,
            locks: KeyLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn reconcile_classroom(
        &self,
        spec: &ClassroomSpec,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        self.reconcile(Desired::Classroom(spec.clone()), cancel).await
    }

    /// Fails with `NotFound`, before any remote call, when the classroom has
    /// no record yet.
    pub async fn reconcile_assignment(
        &self,
        spec: &AssignmentSpec,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        self.reconcile(Desired::Assignment(spec.clone()), cancel).await
    }

    /// Like [`reconcile_assignment`](Self::reconcile_assignment), but first
    /// checks that `classroom_id` names the classroom recorded for the
    /// assignment's organization and course (its course code, name or
    /// remote id).
    pub async fn reconcile_assignment_in(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        let classroom_key = spec.classroom_key();
        // without a record reconcile reports NotFound before any remote call
        if let Some(record) = self.store.get(&classroom_key).await? {
            let recorded: ClassroomSpec = serde_json::from_value(record.applied.clone())?;
            if !recorded.is_named(classroom_id, &record.remote_id) {
                return Err(ValidationError::Other(format!(
                    "classroom {classroom_id:?} does not match {classroom_key} ({})",
                    recorded.name
                ))
                .into());
            }
        }
        self.reconcile_assignment(spec, cancel).await
    }

    pub async fn reconcile(
        &self,
        desired: Desired,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        // course codes are case-insensitive; snapshot them the way keys store them
        let desired = match desired {
            Desired::Classroom(mut spec) => {
                spec.course_code.make_ascii_uppercase();
                Desired::Classroom(spec)
            }
            Desired::Assignment(spec) => {
                let mut spec = spec.resolved(self.config.default_points);
                spec.course_code.make_ascii_uppercase();
                Desired::Assignment(spec)
            }
        };
        let key = desired.key();
        let started = Instant::now();
        obs::emit_reconcile_started(&key);

        let outcome = self.reconcile_locked(&desired, cancel).await;
        match &outcome {
            Ok(result) => obs::emit_reconcile_finished(
                &key,
                result.action.as_str(),
                &result.changed,
                elapsed_ms(started),
            ),
            Err(err) => obs::emit_reconcile_failed(&key, err.category(), err),
        }
        outcome
    }

    /// Reconcile a classroom, then its assignments in order.
    ///
    /// Assignments are skipped when the classroom fails. A failed assignment
    /// does not stop the ones after it; cancellation does.
    pub async fn reconcile_plan(
        &self,
        classroom: &ClassroomSpec,
        assignments: &[AssignmentSpec],
        cancel: &CancelToken,
    ) -> PlanReport {
        let classroom_key = classroom.key();
        let classroom_result = self.reconcile_classroom(classroom, cancel).await;
        let classroom_failed = classroom_result.is_err();
        let classroom_report = ItemReport::new(&classroom_key, classroom_result);

        let mut reports = Vec::with_capacity(assignments.len());
        for spec in assignments {
            let key = spec.key();
            if classroom_failed {
                reports.push(ItemReport::skipped(
                    &key,
                    format!("classroom {classroom_key} was not reconciled"),
                ));
                continue;
            }
            if spec.classroom_key() != classroom_key {
                reports.push(ItemReport::new(
                    &key,
                    Err(ValidationError::Other(format!(
                        "assignment belongs to {}, not {classroom_key}",
                        spec.classroom_key()
                    ))
                    .into()),
                ));
                continue;
            }
            if cancel.is_cancelled() {
                reports.push(ItemReport::skipped(&key, "cancelled"));
                continue;
            }
            let result = self.reconcile_assignment(spec, cancel).await;
            reports.push(ItemReport::new(&key, result));
        }

        PlanReport {
            classroom: classroom_report,
            assignments: reports,
        }
    }

    /// Reconcile every classroom of a manifest concurrently, each followed
    /// by its assignments.
    pub async fn sync(&self, manifest: &Manifest, cancel: &CancelToken) -> Result<SyncReport> {
        let plans = manifest.plans()?;
        let reports = join_all(
            plans
                .iter()
                .map(|(classroom, assignments)| self.reconcile_plan(classroom, assignments, cancel)),
        )
        .await;
        Ok(SyncReport { plans: reports })
    }

    async fn reconcile_locked(
        &self,
        desired: &Desired,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        desired.validate()?;
        let key = desired.key();
        let _guard = self.locks.lock(&key).await;

        let parent = match desired {
            Desired::Classroom(_) => None,
            Desired::Assignment(spec) => {
                let classroom_key = spec.classroom_key();
                let parent = self.store.get(&classroom_key).await?.ok_or_else(|| {
                    LmshError::NotFound(format!(
                        "classroom {classroom_key} has not been provisioned"
                    ))
                })?;
                Some(parent)
            }
        };

        self.drive(desired, parent.as_ref(), cancel).await
    }

    /// The compare-and-swap decision loop.
    async fn drive(
        &self,
        desired: &Desired,
        parent: Option<&ReconciliationRecord>,
        cancel: &CancelToken,
    ) -> Result<ReconciliationResult> {
        let key = desired.key();
        let (applied, digest) = desired.snapshot()?;

        for attempt in 0..self.config.cas_budget {
            cancel.check()?;
            match self.store.get(&key).await? {
                None => {
                    let provisioned = self.provision(desired, parent).await?;
                    cancel.check()?;

                    let record = ReconciliationRecord::new(
                        key.clone(),
                        &provisioned.remote_id,
                        digest.clone(),
                        applied.clone(),
                    )
                    .with_remote_url(provisioned.remote_url.clone());
                    if self.store.compare_and_swap(&key, None, record.clone()).await? {
                        let stored = ReconciliationRecord {
                            revision: 1,
                            ..record
                        };
                        return Ok(ReconciliationResult::from_record(
                            &stored,
                            provisioned.action,
                            provisioned.changed,
                        ));
                    }
                    debug!(key = %key, attempt, "record appeared concurrently, re-reading");
                }
                Some(current) if current.config_digest == digest => {
                    return Ok(ReconciliationResult::from_record(
                        &current,
                        ReconcileAction::Unchanged,
                        Vec::new(),
                    ));
                }
                Some(current) => {
                    let (remote_url, changed) = match self.apply_update(desired, parent, &current).await {
                        Ok(update) => update,
                        Err(err) => {
                            self.record_failure(&current, &err).await;
                            return Err(err);
                        }
                    };
                    cancel.check()?;

                    let next = current
                        .synced(digest.clone(), applied.clone())
                        .with_remote_url(remote_url.or_else(|| current.remote_url.clone()));
                    if self
                        .store
                        .compare_and_swap(&key, Some(&current), next.clone())
                        .await?
                    {
                        let stored = ReconciliationRecord {
                            revision: current.revision + 1,
                            ..next
                        };
                        return Ok(ReconciliationResult::from_record(
                            &stored,
                            ReconcileAction::Updated,
                            changed,
                        ));
                    }
                    debug!(key = %key, attempt, "record changed concurrently, re-reading");
                }
            }
        }

        Err(LmshError::Conflict(format!(
            "{key}: lost {} consecutive compare-and-swap races",
            self.config.cas_budget
        )))
    }

    /// Find-and-adopt or create the remote entity for a key with no record.
    async fn provision(
        &self,
        desired: &Desired,
        parent: Option<&ReconciliationRecord>,
    ) -> Result<Provisioned> {
        match desired {
            Desired::Classroom(spec) => {
                let key = spec.key();
                let (remote, action) = match self.hosting.find_classroom(&key).await? {
                    Some(remote) => (remote, ReconcileAction::Adopted),
                    None => match self.hosting.create_classroom(spec).await {
                        Ok(remote) => (remote, ReconcileAction::Created),
                        Err(AdapterError::AlreadyExists(_)) => {
                            let remote =
                                self.hosting.find_classroom(&key).await?.ok_or_else(|| {
                                    LmshError::Conflict(format!(
                                        "{key}: create rejected as existing but lookup found nothing"
                                    ))
                                })?;
                            (remote, ReconcileAction::Adopted)
                        }
                        Err(err) => return Err(err.into()),
                    },
                };

                let mut provisioned = Provisioned {
                    remote_id: remote.id.clone(),
                    remote_url: remote.url.clone(),
                    action,
                    changed: Vec::new(),
                };
                if action == ReconcileAction::Adopted {
                    ensure_owner(&key, &remote.id, remote.owner.as_deref())?;
                    let changes = ClassroomChanges::between(
                        &remote.observed(&spec.org, &spec.course_code),
                        spec,
                    );
                    if !changes.is_empty() {
                        let updated = self
                            .hosting
                            .update_classroom(&key, &remote.id, &changes)
                            .await?;
                        provisioned.remote_url = updated.url.or(provisioned.remote_url);
                        provisioned.changed = owned(changes.fields());
                    }
                }
                Ok(provisioned)
            }
            Desired::Assignment(spec) => {
                let key = spec.key();
                let parent = parent.ok_or_else(|| {
                    LmshError::NotFound(format!(
                        "classroom {} has not been provisioned",
                        spec.classroom_key()
                    ))
                })?;
                let (remote, action) = match self.hosting.find_assignment(&key).await? {
                    Some(remote) => (remote, ReconcileAction::Adopted),
                    None => match self
                        .hosting
                        .create_assignment(&parent.remote_id, spec)
                        .await
                    {
                        Ok(remote) => (remote, ReconcileAction::Created),
                        Err(AdapterError::AlreadyExists(_)) => {
                            let remote =
                                self.hosting.find_assignment(&key).await?.ok_or_else(|| {
                                    LmshError::Conflict(format!(
                                        "{key}: create rejected as existing but lookup found nothing"
                                    ))
                                })?;
                            (remote, ReconcileAction::Adopted)
                        }
                        Err(err) => return Err(err.into()),
                    },
                };

                let mut provisioned = Provisioned {
                    remote_id: remote.id.clone(),
                    remote_url: remote.acceptance_url.clone(),
                    action,
                    changed: Vec::new(),
                };
                if action == ReconcileAction::Adopted {
                    ensure_owner(&key, &remote.id, remote.owner.as_deref())?;
                    // an interrupted create may have left the assignment detached
                    self.hosting
                        .link_assignment(&parent.remote_id, &key, &remote.id)
                        .await?;
                    let changes = AssignmentChanges::between(&remote.observed(spec), spec);
                    if !changes.is_empty() {
                        let updated = self
                            .hosting
                            .update_assignment(&key, &remote.id, &changes)
                            .await?;
                        provisioned.remote_url = updated.acceptance_url.or(provisioned.remote_url);
                        provisioned.changed = owned(changes.fields());
                    }
                }
                Ok(provisioned)
            }
        }
    }

    /// Send the field-level changes between the recorded snapshot and the
    /// desired state. Returns the refreshed remote URL and changed fields.
    ///
    /// Assignment updates also re-attach the assignment to its classroom.
    async fn apply_update(
        &self,
        desired: &Desired,
        parent: Option<&ReconciliationRecord>,
        current: &ReconciliationRecord,
    ) -> Result<(Option<String>, Vec<String>)> {
        let key = &current.key;
        match desired {
            Desired::Classroom(spec) => {
                let previous = match serde_json::from_value::<ClassroomSpec>(current.applied.clone())
                {
                    Ok(previous) => previous,
                    Err(_) => {
                        warn!(key = %key, "unreadable snapshot, diffing against remote state");
                        self.hosting
                            .find_classroom(key)
                            .await?
                            .ok_or_else(|| LmshError::NotFound(format!("remote classroom for {key}")))?
                            .observed(&spec.org, &spec.course_code)
                    }
                };
                let changes = ClassroomChanges::between(&previous, spec);
                if changes.is_empty() {
                    return Ok((None, Vec::new()));
                }
                let remote = self
                    .hosting
                    .update_classroom(key, &current.remote_id, &changes)
                    .await?;
                Ok((remote.url, owned(changes.fields())))
            }
            Desired::Assignment(spec) => {
                let previous =
                    match serde_json::from_value::<AssignmentSpec>(current.applied.clone()) {
                        Ok(previous) => previous,
                        Err(_) => {
                            warn!(key = %key, "unreadable snapshot, diffing against remote state");
                            self.hosting
                                .find_assignment(key)
                                .await?
                                .ok_or_else(|| {
                                    LmshError::NotFound(format!("remote assignment for {key}"))
                                })?
                                .observed(spec)
                        }
                    };
                let changes = AssignmentChanges::between(&previous, spec);
                if changes.is_empty() {
                    return Ok((None, Vec::new()));
                }
                let remote = self
                    .hosting
                    .update_assignment(key, &current.remote_id, &changes)
                    .await?;
                if let Some(parent) = parent {
                    self.hosting
                        .link_assignment(&parent.remote_id, key, &current.remote_id)
                        .await?;
                }
                Ok((remote.acceptance_url, owned(changes.fields())))
            }
        }
    }

    /// Remember a failed update on the existing record.
    async fn record_failure(&self, current: &ReconciliationRecord, err: &LmshError) {
        let failed = current.failed(err.to_string());
        match self
            .store
            .compare_and_swap(&current.key, Some(current), failed)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(key = %current.key, "record moved on, last_error not written"),
            Err(store_err) => {
                warn!(key = %current.key, error = %store_err, "failed to record last_error")
            }
        }
    }
}

/// Add the LMS enrollment of `spec`'s course to its roster.
pub async fn merge_lms_roster(lms: &dyn Lms, spec: ClassroomSpec) -> Result<ClassroomSpec> {
    let roster = lms.list_roster(&spec.course_code).await?;
    info!(course = %spec.course_code, students = roster.len(), "merging LMS roster");
    Ok(spec.with_students(roster))
}

/// Milliseconds since `started`, saturating.
pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    saturating_ms(started.elapsed())
}

fn saturating_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ensure_owner(key: &EntityKey, remote_id: &str, owner: Option<&str>) -> Result<()> {
    match owner {
        Some(owner) if owner.eq_ignore_ascii_case(key.course_code()) => Ok(()),
        Some(owner) => Err(LmshError::Conflict(format!(
            "{key}: remote {remote_id} is owned by course {owner}"
        ))),
        None => Err(LmshError::Conflict(format!(
            "{key}: remote {remote_id} exists without an lmsh ownership marker"
        ))),
    }
}
