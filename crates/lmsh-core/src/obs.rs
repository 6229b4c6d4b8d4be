//! Structured observability hooks for reconciliation and propagation runs.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for lifecycle events: reconcile start/finish/failure,
//!   propagation start/per-submission/finish, and retry scheduling
//!
//! Events are emitted at `info!` (failures and retries at `warn!`); filter
//! with `LMSH_LOG` or `RUST_LOG`.

use std::time::Duration;

use lmsh_state::EntityKey;
use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("sync", "8c1d...");
/// // every event below carries op = "sync" and run_id = "8c1d..."
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(op: &str, run_id: &str) -> Self {
        let span = tracing::info_span!("lmsh.run", op = %op, run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_reconcile_started(key: &EntityKey) {
    info!(event = "reconcile.started", key = %key, kind = %key.kind());
}

/// Emit event: reconcile finished with the action taken and changed fields.
pub fn emit_reconcile_finished(
    key: &EntityKey,
    action: &str,
    changed: &[String],
    duration_ms: u64,
) {
    info!(
        event = "reconcile.finished",
        key = %key,
        action = %action,
        changed = ?changed,
        duration_ms = duration_ms,
    );
}

pub fn emit_reconcile_failed(key: &EntityKey, category: &str, error: &dyn std::fmt::Display) {
    warn!(event = "reconcile.failed", key = %key, category = %category, error = %error);
}

pub fn emit_propagate_started(assignment: &EntityKey, submissions: usize, auto: bool) {
    info!(
        event = "propagate.started",
        assignment = %assignment,
        submissions = submissions,
        auto = auto,
    );
}

/// Emit event: outcome for one student's submission.
pub fn emit_propagate_submission(
    assignment: &EntityKey,
    student: &str,
    revision: &str,
    outcome: &str,
) {
    info!(
        event = "propagate.submission",
        assignment = %assignment,
        student = %student,
        revision = %revision,
        outcome = %outcome,
    );
}

pub fn emit_propagate_finished(
    assignment: &EntityKey,
    propagated: usize,
    failed: usize,
    duration_ms: u64,
) {
    info!(
        event = "propagate.finished",
        assignment = %assignment,
        propagated = propagated,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: a transient adapter failure will be retried (warning level).
pub fn emit_retry_scheduled(
    operation: &str,
    attempt: u32,
    delay: Duration,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "retry.scheduled",
        operation = %operation,
        attempt = attempt,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %error,
    );
}
