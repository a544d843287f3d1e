//! Violation records, their state machine and per-rule reconciliation.

use crate::rule::RuleId;
use crate::sql_compiler::CompiledQuery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationStatus {
    Open,
    Resolved,
    Dismissed,
}

impl ViolationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationStatus::Open => "open",
            ViolationStatus::Resolved => "resolved",
            ViolationStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown violation status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ViolationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ViolationStatus::Open),
            "resolved" => Ok(ViolationStatus::Resolved),
            "dismissed" => Ok(ViolationStatus::Dismissed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Whether a closed violation reopens when its rule flags the record again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Closed violations stay closed.
    Never,
    /// Auto-resolved violations reopen; dismissals are final.
    #[default]
    ResolvedOnly,
    /// Both resolved and dismissed violations reopen.
    Always,
}

impl ReopenPolicy {
    pub fn allows(self, from: ViolationStatus) -> bool {
        match (self, from) {
            (_, ViolationStatus::Open) => false,
            (ReopenPolicy::Never, _) => false,
            (ReopenPolicy::ResolvedOnly, ViolationStatus::Resolved) => true,
            (ReopenPolicy::ResolvedOnly, ViolationStatus::Dismissed) => false,
            (ReopenPolicy::Always, _) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("violation cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: ViolationStatus,
    pub to: ViolationStatus,
}

/// Reviewer decision on an open violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "note", rename_all = "lowercase")]
pub enum ReviewAction {
    /// Condition stands but is accepted.
    Dismiss(Option<String>),
    /// Corrected outside the QC run.
    Resolve(Option<String>),
}

/// One row returned by a violation query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolatingRow {
    pub subject_id: String,
    pub visit_number: String,
    pub actual_value: Option<String>,
}

impl ViolatingRow {
    pub fn record_id(&self, field_name: &str) -> String {
        record_id(&self.subject_id, &self.visit_number, field_name)
    }
}

/// `subject/visit/field`
pub fn record_id(subject_id: &str, visit_number: &str, field_name: &str) -> String {
    format!("{}/{}/{}", subject_id, visit_number, field_name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub violation_id: Uuid,
    pub rule_id: RuleId,
    pub record_id: String,
    pub subject_id: String,
    pub visit_number: String,
    pub field_name: String,
    pub expected_description: String,
    pub actual_value: Option<String>,
    pub first_detected_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub status: ViolationStatus,
    pub status_changed_at: DateTime<Utc>,
    pub reviewer_note: Option<String>,
}

impl Violation {
    pub fn open(query: &CompiledQuery, row: &ViolatingRow, now: DateTime<Utc>) -> Self {
        Self {
            violation_id: Uuid::new_v4(),
            rule_id: query.rule_id.clone(),
            record_id: row.record_id(&query.field_name),
            subject_id: row.subject_id.clone(),
            visit_number: row.visit_number.clone(),
            field_name: query.field_name.clone(),
            expected_description: query.expected_description.clone(),
            actual_value: row.actual_value.clone(),
            first_detected_at: now,
            last_confirmed_at: now,
            status: ViolationStatus::Open,
            status_changed_at: now,
            reviewer_note: None,
        }
    }

    /// Apply a status change if the state machine allows it.
    ///
    /// ```text
    /// open ──▶ resolved ──▶ open
    ///   └────▶ dismissed ─▶ open
    /// ```
    pub fn transition(
        &mut self,
        to: ViolationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        use ViolationStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Open, Resolved) | (Open, Dismissed) | (Resolved, Open) | (Dismissed, Open)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.status_changed_at = now;
        Ok(())
    }

    pub fn review(
        &mut self,
        action: ReviewAction,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let (to, note) = match action {
            ReviewAction::Dismiss(note) => (ViolationStatus::Dismissed, note),
            ReviewAction::Resolve(note) => (ViolationStatus::Resolved, note),
        };
        self.transition(to, now)?;
        if note.is_some() {
            self.reviewer_note = note;
        }
        Ok(())
    }

    fn confirm(&mut self, query: &CompiledQuery, row: &ViolatingRow, now: DateTime<Utc>) {
        self.last_confirmed_at = now;
        self.actual_value = row.actual_value.clone();
        self.expected_description = query.expected_description.clone();
    }
}

/// Writes one rule's run produces. Applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViolationChanges {
    pub inserted: Vec<Violation>,
    pub updated: Vec<Violation>,
    /// New plus reopened.
    pub opened: u64,
    pub closed: u64,
}

impl ViolationChanges {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty()
    }
}

/// Compare the rows a rule flags now with the violations it recorded before.
///
/// - a flagged record without a violation gets a new open one
/// - an open violation still flagged is refreshed
/// - a resolved or dismissed one still flagged reopens if `policy` allows
/// - an open violation no longer flagged is resolved
///
/// Dismissed violations that are no longer flagged are left alone.
pub fn reconcile(
    query: &CompiledQuery,
    existing: Vec<Violation>,
    rows: &[ViolatingRow],
    now: DateTime<Utc>,
    policy: ReopenPolicy,
) -> ViolationChanges {
    let mut changes = ViolationChanges::default();
    let mut existing: HashMap<String, Violation> = existing
        .into_iter()
        .map(|violation| (violation.record_id.clone(), violation))
        .collect();
    let mut flagged = HashSet::new();

    for row in rows {
        let record_id = row.record_id(&query.field_name);
        if !flagged.insert(record_id.clone()) {
            continue;
        }
        match existing.remove(&record_id) {
            None => {
                changes.inserted.push(Violation::open(query, row, now));
                changes.opened += 1;
            }
            Some(mut violation) => match violation.status {
                ViolationStatus::Open => {
                    violation.confirm(query, row, now);
                    changes.updated.push(violation);
                }
                closed if policy.allows(closed) => {
                    violation.confirm(query, row, now);
                    if violation.transition(ViolationStatus::Open, now).is_ok() {
                        changes.opened += 1;
                    }
                    changes.updated.push(violation);
                }
                ViolationStatus::Resolved | ViolationStatus::Dismissed => {}
            },
        }
    }

    for mut violation in existing.into_values() {
        if violation.status == ViolationStatus::Open
            && violation.transition(ViolationStatus::Resolved, now).is_ok()
        {
            changes.closed += 1;
            changes.updated.push(violation);
        }
    }

    changes
}
