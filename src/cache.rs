//! Compiled rule cache with build-then-swap semantics.
//!
//! A [`ValidationCache`] is immutable once built. Readers take an
//! `Arc` snapshot from the [`CacheHandle`] and keep using it for as long as
//! they like; a rebuild constructs a complete new cache off to the side and
//! replaces the pointer in one step, so nobody observes a half-built cache.

use crate::config::EngineConfig;
use crate::parser::{parse_rule, ParseError};
use crate::predicate::{CodegenError, CompiledValidator, ValidationResult};
use crate::rule::{Rule, RuleId, Severity};
use crate::sql_compiler::{CompileError, CompiledQuery, SqlCompiler};
use crate::value::{FieldValue, RecordContext};
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a rule was left out of a build.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("closure generation failed: {0}")]
    Codegen(#[from] CodegenError),
    #[error("SQL generation failed: {0}")]
    Sql(#[from] CompileError),
    #[error("duplicate rule id")]
    DuplicateId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub rule_id: RuleId,
    pub error: RuleError,
}

/// Both artifacts for one rule. Either side is absent when the rule's
/// scope excludes that target.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub rule: Rule,
    pub content_hash: String,
    pub validator: Option<Arc<CompiledValidator>>,
    pub query: Option<Arc<CompiledQuery>>,
}

impl CacheEntry {
    /// Same text and the same binding, so the artifacts can be shared.
    fn is_reusable_for(&self, rule: &Rule, content_hash: &str) -> bool {
        self.content_hash == content_hash
            && self.rule.form_id == rule.form_id
            && self.rule.field_name == rule.field_name
            && self.rule.scope == rule.scope
            && self.rule.severity == rule.severity
    }
}

/// Result of one real-time rule on a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    pub rule_id: RuleId,
    pub severity: Severity,
    pub result: ValidationResult,
}

/// An immutable set of compiled rules.
#[derive(Debug)]
pub struct ValidationCache {
    entries: HashMap<RuleId, CacheEntry>,
    /// `(form_id, field_name)` to real-time rules, in rule order.
    by_field: HashMap<(String, String), Vec<RuleId>>,
    built_at: DateTime<Utc>,
    /// Settings the batch queries were generated with.
    compiled_with: Option<SqlCompiler>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_field: HashMap::new(),
            built_at: Utc::now(),
            compiled_with: None,
        }
    }
}

impl ValidationCache {
    pub fn lookup(&self, rule_id: &RuleId) -> Option<&CacheEntry> {
        self.entries.get(rule_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// The SQL compiler settings of the last build, `None` for an empty default cache.
    pub fn compiled_with(&self) -> Option<&SqlCompiler> {
        self.compiled_with.as_ref()
    }

    /// Real-time validators bound to a field.
    pub fn validators_for(&self, form_id: &str, field_name: &str) -> Vec<Arc<CompiledValidator>> {
        self.by_field
            .get(&(form_id.to_string(), field_name.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id)?.validator.clone())
            .collect()
    }

    /// Run every real-time rule bound to `form_id`/`field_name`.
    pub fn validate_field(
        &self,
        form_id: &str,
        field_name: &str,
        value: &FieldValue,
        record: &RecordContext,
    ) -> Vec<FieldOutcome> {
        self.validate_field_at(
            form_id,
            field_name,
            value,
            record,
            chrono::Local::now().date_naive(),
        )
    }

    pub fn validate_field_at(
        &self,
        form_id: &str,
        field_name: &str,
        value: &FieldValue,
        record: &RecordContext,
        today: NaiveDate,
    ) -> Vec<FieldOutcome> {
        self.validators_for(form_id, field_name)
            .iter()
            .map(|validator| FieldOutcome {
                rule_id: validator.rule_id.clone(),
                severity: validator.severity,
                result: validator.validate_at(value, record, today),
            })
            .collect()
    }

    /// Batch queries, ordered by rule id.
    pub fn batch_queries(&self) -> Vec<Arc<CompiledQuery>> {
        let mut queries: Vec<Arc<CompiledQuery>> = self
            .entries
            .values()
            .filter_map(|entry| entry.query.clone())
            .collect();
        queries.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        queries
    }
}

/// Outcome of compiling a rule set.
#[derive(Debug)]
pub enum CacheBuild {
    Complete(ValidationCache),
    /// Failing rules are excluded; every other rule is usable.
    PartialFailure {
        valid: ValidationCache,
        failures: Vec<RuleFailure>,
    },
}

impl CacheBuild {
    pub fn cache(&self) -> &ValidationCache {
        match self {
            CacheBuild::Complete(cache) => cache,
            CacheBuild::PartialFailure { valid, .. } => valid,
        }
    }

    pub fn failures(&self) -> &[RuleFailure] {
        match self {
            CacheBuild::Complete(_) => &[],
            CacheBuild::PartialFailure { failures, .. } => failures,
        }
    }

    pub fn into_parts(self) -> (ValidationCache, Vec<RuleFailure>) {
        match self {
            CacheBuild::Complete(cache) => (cache, Vec::new()),
            CacheBuild::PartialFailure { valid, failures } => (valid, failures),
        }
    }
}

/// Runs lexer, parser and both code generators over a rule set.
pub struct RuleCompiler {
    sql: SqlCompiler,
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new(SqlCompiler::default())
    }
}

impl RuleCompiler {
    pub fn new(sql: SqlCompiler) -> Self {
        Self { sql }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(SqlCompiler::from_config(config))
    }

    pub fn build(&self, rules: &[Rule]) -> CacheBuild {
        self.build_from(None, rules)
    }

    /// Build a new cache, sharing artifacts of unchanged rules with `previous`.
    /// Batch queries are only shared when `previous` was built with the same
    /// SQL settings.
    pub fn build_from(&self, previous: Option<&ValidationCache>, rules: &[Rule]) -> CacheBuild {
        let mut cache = ValidationCache {
            compiled_with: Some(self.sql.clone()),
            ..ValidationCache::default()
        };
        let mut failures = Vec::new();
        let mut reused = 0usize;
        let same_sql =
            previous.is_some_and(|cache| cache.compiled_with.as_ref() == Some(&self.sql));

        for rule in rules.iter().filter(|rule| rule.active) {
            if cache.entries.contains_key(&rule.id) {
                warn!(rule_id = %rule.id, "duplicate rule id, later definition excluded");
                failures.push(RuleFailure {
                    rule_id: rule.id.clone(),
                    error: RuleError::DuplicateId,
                });
                continue;
            }

            let content_hash = rule.content_hash();
            let previous_entry = previous
                .and_then(|cache| cache.lookup(&rule.id))
                .filter(|entry| entry.is_reusable_for(rule, &content_hash))
                .filter(|entry| same_sql || entry.query.is_none());
            let entry = match previous_entry {
                Some(entry) => {
                    reused += 1;
                    entry.clone()
                }
                None => match self.compile_rule(rule, content_hash) {
                    Ok(entry) => entry,
                    Err(error) => {
                        warn!(
                            rule_id = %rule.id,
                            form_id = %rule.form_id,
                            error = %error,
                            "rule excluded from cache"
                        );
                        failures.push(RuleFailure {
                            rule_id: rule.id.clone(),
                            error,
                        });
                        continue;
                    }
                },
            };

            if entry.validator.is_some() {
                cache
                    .by_field
                    .entry((rule.form_id.clone(), rule.field_name.clone()))
                    .or_default()
                    .push(rule.id.clone());
            }
            cache.entries.insert(rule.id.clone(), entry);
        }

        info!(
            compiled = cache.entries.len(),
            reused,
            failed = failures.len(),
            "validation cache built"
        );

        if failures.is_empty() {
            CacheBuild::Complete(cache)
        } else {
            CacheBuild::PartialFailure {
                valid: cache,
                failures,
            }
        }
    }

    fn compile_rule(&self, rule: &Rule, content_hash: String) -> Result<CacheEntry, RuleError> {
        let node = parse_rule(&rule.rule_text)?;
        let validator = if rule.scope.includes_realtime() {
            Some(Arc::new(CompiledValidator::compile(rule, &node, &content_hash)?))
        } else {
            None
        };
        let query = if rule.scope.includes_batch() {
            Some(Arc::new(self.sql.compile(rule, &node, &content_hash)?))
        } else {
            None
        };
        Ok(CacheEntry {
            rule: rule.clone(),
            content_hash,
            validator,
            query,
        })
    }
}

/// The swap point readers go through.
#[derive(Default)]
pub struct CacheHandle {
    current: RwLock<Arc<ValidationCache>>,
    rebuild_lock: Mutex<()>,
}

impl CacheHandle {
    pub fn new(cache: ValidationCache) -> Self {
        Self {
            current: RwLock::new(Arc::new(cache)),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// The cache as of now. Later swaps do not affect the returned value.
    pub fn snapshot(&self) -> Arc<ValidationCache> {
        self.current.read().clone()
    }

    /// Replace the current cache, returning the one it displaced.
    pub fn install(&self, cache: ValidationCache) -> Arc<ValidationCache> {
        let cache = Arc::new(cache);
        std::mem::replace(&mut *self.current.write(), cache)
    }

    /// Recompile `rules` against the current cache and swap the result in.
    /// Concurrent rebuilds are serialised; readers are never blocked for
    /// longer than the pointer swap.
    pub fn rebuild(&self, compiler: &RuleCompiler, rules: &[Rule]) -> Vec<RuleFailure> {
        let _guard = self.rebuild_lock.lock();
        let previous = self.snapshot();
        let (cache, failures) = compiler.build_from(Some(&previous), rules).into_parts();
        self.install(cache);
        failures
    }
}

static GLOBAL: Lazy<CacheHandle> = Lazy::new(CacheHandle::default);

/// Process-wide cache handle.
pub fn global() -> &'static CacheHandle {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleScope;
    use crate::sql_compiler::SqlDialect;

    fn rules() -> Vec<Rule> {
        vec![
            Rule::new("DM-01", "DM", "age", "age between 18 and 65"),
            Rule::new("DM-02", "DM", "consent_date", "required unless status == 'Withdrawn'"),
            Rule::new("VS-01", "VS", "weight", "weight > 0").with_scope(RuleScope::Realtime),
        ]
    }

    #[test]
    fn test_build_complete() {
        let build = RuleCompiler::default().build(&rules());
        assert!(matches!(build, CacheBuild::Complete(_)));
        let cache = build.cache();
        assert_eq!(cache.len(), 3);

        let entry = cache.lookup(&RuleId::from("VS-01")).unwrap();
        assert!(entry.validator.is_some());
        assert!(entry.query.is_none());
        assert_eq!(cache.batch_queries().len(), 2);
    }

    #[test]
    fn test_malformed_rule_is_isolated() {
        let mut rules = rules();
        rules.push(Rule::new("DM-03", "DM", "height", "height between 100 and"));
        rules.push(Rule::new("DM-04", "DM", "age", "frobnicate(age) > 1"));

        let build = RuleCompiler::default().build(&rules);
        let failures = build.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].rule_id, RuleId::from("DM-03"));
        assert!(matches!(failures[0].error, RuleError::Parse(_)));
        assert!(build.cache().lookup(&RuleId::from("DM-03")).is_none());
        assert_eq!(build.cache().len(), 3);
    }

    #[test]
    fn test_inactive_and_duplicate_rules() {
        let mut rules = rules();
        let mut inactive = Rule::new("DM-05", "DM", "age", "age > 0");
        inactive.active = false;
        rules.push(inactive);
        rules.push(Rule::new("DM-01", "DM", "age", "age > 0"));

        let build = RuleCompiler::default().build(&rules);
        assert!(build.cache().lookup(&RuleId::from("DM-05")).is_none());
        assert_eq!(build.failures()[0].error, RuleError::DuplicateId);
    }

    #[test]
    fn test_validate_field_runs_bound_rules() {
        let cache = RuleCompiler::default().build(&rules()).into_parts().0;
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let outcomes =
            cache.validate_field_at("DM", "age", &FieldValue::from(10_i64), &RecordContext::new(), today);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].rule_id, RuleId::from("DM-01"));
        assert!(!outcomes[0].result.is_valid());

        assert!(cache
            .validate_field_at("AE", "age", &FieldValue::from(10_i64), &RecordContext::new(), today)
            .is_empty());
    }

    #[test]
    fn test_rebuild_reuses_unchanged_artifacts() {
        let compiler = RuleCompiler::default();
        let handle = CacheHandle::default();
        assert!(handle.rebuild(&compiler, &rules()).is_empty());
        let before = handle.snapshot();

        let mut changed = rules();
        changed[0].rule_text = "age between 18 and 70".to_string();
        handle.rebuild(&compiler, &changed);
        let after = handle.snapshot();

        let id = RuleId::from("DM-02");
        assert!(Arc::ptr_eq(
            before.lookup(&id).unwrap().validator.as_ref().unwrap(),
            after.lookup(&id).unwrap().validator.as_ref().unwrap(),
        ));
        assert!(Arc::ptr_eq(
            before.lookup(&id).unwrap().query.as_ref().unwrap(),
            after.lookup(&id).unwrap().query.as_ref().unwrap(),
        ));

        let id = RuleId::from("DM-01");
        assert!(!Arc::ptr_eq(
            before.lookup(&id).unwrap().validator.as_ref().unwrap(),
            after.lookup(&id).unwrap().validator.as_ref().unwrap(),
        ));
        assert_ne!(
            before.lookup(&id).unwrap().content_hash,
            after.lookup(&id).unwrap().content_hash
        );
    }

    #[test]
    fn test_changed_sql_settings_recompile_queries() {
        let handle = CacheHandle::default();
        handle.rebuild(&RuleCompiler::default(), &rules());
        let before = handle.snapshot();

        let sqlite = EngineConfig {
            dialect: SqlDialect::Sqlite,
            ..EngineConfig::default()
        };
        handle.rebuild(&RuleCompiler::from_config(&sqlite), &rules());
        let after = handle.snapshot();
        assert_eq!(
            after.compiled_with().map(SqlCompiler::dialect),
            Some(SqlDialect::Sqlite)
        );
        for query in after.batch_queries() {
            assert_eq!(query.dialect, SqlDialect::Sqlite);
            assert!(!query.sql_template.contains('$'));
        }
        let id = RuleId::from("DM-01");
        assert!(!Arc::ptr_eq(
            before.lookup(&id).unwrap().query.as_ref().unwrap(),
            after.lookup(&id).unwrap().query.as_ref().unwrap(),
        ));

        let mut mapped = sqlite.clone();
        mapped
            .table_mapping
            .mappings
            .insert("DM".to_string(), "demographics".to_string());
        handle.rebuild(&RuleCompiler::from_config(&mapped), &rules());
        let query = handle
            .snapshot()
            .lookup(&id)
            .unwrap()
            .query
            .clone()
            .unwrap();
        assert_eq!(query.target_table, "demographics");

        // Real-time only rules carry no SQL and are shared across settings.
        let id = RuleId::from("VS-01");
        assert!(Arc::ptr_eq(
            after.lookup(&id).unwrap().validator.as_ref().unwrap(),
            handle.snapshot().lookup(&id).unwrap().validator.as_ref().unwrap(),
        ));
    }

    #[test]
    fn test_rebinding_a_rule_recompiles_it() {
        let compiler = RuleCompiler::default();
        let first = compiler.build(&rules()).into_parts().0;
        let mut moved = rules();
        moved[2].severity = Severity::Warning;
        let second = compiler.build_from(Some(&first), &moved).into_parts().0;

        let id = RuleId::from("VS-01");
        let validator = second.lookup(&id).unwrap().validator.as_ref().unwrap();
        assert_eq!(validator.severity, Severity::Warning);
        assert!(!Arc::ptr_eq(
            first.lookup(&id).unwrap().validator.as_ref().unwrap(),
            validator
        ));
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let handle = CacheHandle::default();
        let compiler = RuleCompiler::default();
        handle.rebuild(&compiler, &rules());
        let held = handle.snapshot();

        let displaced = handle.install(ValidationCache::default());
        assert!(Arc::ptr_eq(&held, &displaced));
        assert_eq!(held.len(), 3);
        assert!(handle.snapshot().is_empty());
    }

    #[test]
    fn test_readers_never_see_partial_cache() {
        let handle = CacheHandle::default();
        let compiler = RuleCompiler::default();
        let small = rules()[..1].to_vec();
        let full = rules();
        handle.rebuild(&compiler, &small);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let len = handle.snapshot().len();
                        assert!(len == 1 || len == 3, "observed {len} entries");
                    }
                });
            }
            for i in 0..20 {
                let set = if i % 2 == 0 { &full } else { &small };
                handle.rebuild(&compiler, set);
            }
        });
    }

    #[test]
    fn test_global_handle_is_shared() {
        assert!(std::ptr::eq(global(), global()));
    }
}
