//! Batch QC engine.
//!
//! Runs every batch-scoped compiled query against a [`QcStore`], reconciles
//! the flagged rows with the violations recorded by earlier runs, and writes
//! the difference in one short transaction per rule. A failing rule is
//! logged and counted; it never stops the run.

mod store;
mod violation;

pub use store::{QcStore, SqliteStore, StoreError};
pub use violation::{
    reconcile, record_id, ReopenPolicy, ReviewAction, TransitionError, UnknownStatus,
    ViolatingRow, Violation, ViolationChanges, ViolationStatus,
};

use crate::cache::ValidationCache;
use crate::config::EngineConfig;
use crate::rule::RuleId;
use crate::sql_compiler::CompiledQuery;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cross-thread stop signal. Checked between rules: the rule in flight
/// finishes, no further rule starts.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the handle for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailureReport {
    pub rule_id: RuleId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub rules_run: u64,
    pub rules_failed: u64,
    pub rows_scanned: u64,
    pub violations_opened: u64,
    pub violations_closed: u64,
    pub duration: Duration,
    pub failures: Vec<RuleFailureReport>,
    /// Stopped early through an [`AbortHandle`].
    pub aborted: bool,
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

struct RuleOutcome {
    rows_scanned: u64,
    opened: u64,
    closed: u64,
}

pub struct QcEngine<S: QcStore> {
    store: S,
    reopen_policy: ReopenPolicy,
    abort: AbortHandle,
}

impl<S: QcStore> QcEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            reopen_policy: ReopenPolicy::default(),
            abort: AbortHandle::default(),
        }
    }

    pub fn from_config(store: S, config: &EngineConfig) -> Self {
        Self::new(store).with_reopen_policy(config.reopen_policy)
    }

    pub fn with_reopen_policy(mut self, policy: ReopenPolicy) -> Self {
        self.reopen_policy = policy;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Run every batch query of a cache snapshot.
    pub fn run(&mut self, cache: &ValidationCache) -> RunSummary {
        self.run_queries(&cache.batch_queries())
    }

    pub fn run_queries(&mut self, queries: &[Arc<CompiledQuery>]) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(rules = queries.len(), "QC run started");

        for query in queries {
            if self.abort.is_aborted() {
                warn!(
                    remaining = queries.len() as u64 - summary.rules_run,
                    "QC run aborted"
                );
                summary.aborted = true;
                break;
            }

            summary.rules_run += 1;
            match self.run_rule(query) {
                Ok(outcome) => {
                    debug!(
                        rule_id = %query.rule_id,
                        rows_scanned = outcome.rows_scanned,
                        opened = outcome.opened,
                        closed = outcome.closed,
                        "rule checked"
                    );
                    summary.rows_scanned += outcome.rows_scanned;
                    summary.violations_opened += outcome.opened;
                    summary.violations_closed += outcome.closed;
                }
                Err(err) => {
                    error!(rule_id = %query.rule_id, error = %err, "QC rule failed");
                    summary.rules_failed += 1;
                    summary.failures.push(RuleFailureReport {
                        rule_id: query.rule_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        summary.duration = started.elapsed();
        info!(
            rules_run = summary.rules_run,
            rules_failed = summary.rules_failed,
            rows_scanned = summary.rows_scanned,
            violations_opened = summary.violations_opened,
            violations_closed = summary.violations_closed,
            duration_ms = summary.duration.as_millis() as u64,
            "QC run finished"
        );
        summary
    }

    fn run_rule(&mut self, query: &CompiledQuery) -> Result<RuleOutcome, StoreError> {
        let rows_scanned = self.store.count_rows(query)?;
        let rows = self.store.fetch_violating_rows(query)?;
        let existing = self.store.load_violations(&query.rule_id)?;
        let changes = reconcile(query, existing, &rows, Utc::now(), self.reopen_policy);
        self.store.apply_changes(&changes)?;
        Ok(RuleOutcome {
            rows_scanned,
            opened: changes.opened,
            closed: changes.closed,
        })
    }

    /// Apply a reviewer decision to one violation.
    pub fn review(
        &mut self,
        violation_id: Uuid,
        action: ReviewAction,
    ) -> Result<Violation, ReviewError> {
        let mut violation = self.store.load_violation(violation_id)?;
        violation.review(action, Utc::now())?;
        self.store.update_violation(&violation)?;
        info!(
            violation_id = %violation.violation_id,
            rule_id = %violation.rule_id,
            status = %violation.status,
            "violation reviewed"
        );
        Ok(violation)
    }
}
