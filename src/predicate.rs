//! Closure code generation for real-time validation.
//!
//! The AST is turned into a tree of composed closures once, at cache build
//! time. Evaluation never touches rule text: every node becomes a typed
//! `Fn(&Scope) -> ...` object chosen by an exhaustive match.
//!
//! Evaluation uses three-valued logic. A referenced field that is absent or
//! blank makes its comparison [`Truth::Unknown`], which `and`/`or` propagate
//! the way SQL does, so the real-time and batch verdicts agree. A value that
//! is present but cannot be read as the type its rule compares against is a
//! failed check, never an unknown one.

use crate::ast::{BinOp, FieldPath, Literal, Node, VisitRef};
use crate::functions::ClinicalFunction;
use crate::rule::{Rule, RuleId, Severity};
use crate::value::{FieldValue, RecordContext};
use chrono::{Local, NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Kleene truth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(value: bool) -> Self {
        if value {
            Truth::True
        } else {
            Truth::False
        }
    }
}

/// Outcome of validating one field value against one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    Invalid(String),
    /// A referenced field was missing, so the rule could not be evaluated.
    Indeterminate,
}

impl ValidationResult {
    /// `false` only for `Invalid`; indeterminate outcomes do not block entry.
    pub fn is_valid(&self) -> bool {
        !matches!(self, ValidationResult::Invalid(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ValidationResult::Invalid(message) => Some(message),
            ValidationResult::Valid | ValidationResult::Indeterminate => None,
        }
    }

    pub fn passes(&self, policy: IndeterminatePolicy) -> bool {
        match self {
            ValidationResult::Valid => true,
            ValidationResult::Invalid(_) => false,
            ValidationResult::Indeterminate => policy == IndeterminatePolicy::Pass,
        }
    }
}

/// How the form layer treats [`ValidationResult::Indeterminate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndeterminatePolicy {
    #[default]
    Pass,
    Block,
}

/// Everything a compiled predicate may read.
pub struct Scope<'r> {
    field: &'r str,
    value: &'r FieldValue,
    record: &'r RecordContext,
    today: NaiveDate,
}

impl<'r> Scope<'r> {
    pub fn new(
        field: &'r str,
        value: &'r FieldValue,
        record: &'r RecordContext,
        today: NaiveDate,
    ) -> Self {
        Self {
            field,
            value,
            record,
            today,
        }
    }

    /// The field under validation resolves to the supplied value; anything
    /// else comes from the record context.
    fn lookup(&self, path: &FieldPath) -> Option<&'r FieldValue> {
        if path.visit == VisitRef::Current && path.name.eq_ignore_ascii_case(self.field) {
            return Some(self.value);
        }
        match path.visit {
            VisitRef::Current => self.record.get(&path.name),
            VisitRef::Previous | VisitRef::First => self.record.get(&path.context_key()),
        }
    }

    /// Like `lookup`, but blank values count as absent.
    fn present(&self, path: &FieldPath) -> Option<FieldValue> {
        self.lookup(path).filter(|v| !v.is_blank()).cloned()
    }
}

type ValueFn = Arc<dyn Fn(&Scope<'_>) -> Option<FieldValue> + Send + Sync>;
type ConditionFn = Arc<dyn Fn(&Scope<'_>) -> Truth + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("expected a condition, found value expression '{0}'")]
    NotACondition(String),
    #[error("expected a value, found condition '{0}'")]
    NotAValue(String),
    #[error("{function}() expects {expected} argument(s), got {found}")]
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
    },
}

/// A compiled rule body.
#[derive(Clone)]
pub struct Predicate {
    condition: ConditionFn,
}

impl Predicate {
    pub fn evaluate(&self, scope: &Scope<'_>) -> Truth {
        (self.condition)(scope)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

pub fn compile_predicate(node: &Node) -> Result<Predicate, CodegenError> {
    Ok(Predicate {
        condition: compile_condition(node)?,
    })
}

fn compile_condition(node: &Node) -> Result<ConditionFn, CodegenError> {
    let condition: ConditionFn = match node {
        Node::BinaryOp { op, left, right } => match op {
            BinOp::And => {
                let (left, right) = (compile_condition(left)?, compile_condition(right)?);
                Arc::new(move |scope: &Scope<'_>| match left(scope) {
                    Truth::False => Truth::False,
                    Truth::True => right(scope),
                    Truth::Unknown => match right(scope) {
                        Truth::False => Truth::False,
                        Truth::True | Truth::Unknown => Truth::Unknown,
                    },
                })
            }
            BinOp::Or => {
                let (left, right) = (compile_condition(left)?, compile_condition(right)?);
                Arc::new(move |scope: &Scope<'_>| match left(scope) {
                    Truth::True => Truth::True,
                    Truth::False => right(scope),
                    Truth::Unknown => match right(scope) {
                        Truth::True => Truth::True,
                        Truth::False | Truth::Unknown => Truth::Unknown,
                    },
                })
            }
            BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => {
                let op = *op;
                let fields = operand_fields(node);
                let (left, right) = (compile_value(left)?, compile_value(right)?);
                Arc::new(move |scope: &Scope<'_>| match (left(scope), right(scope)) {
                    (Some(a), Some(b)) => compare(op, &a, &b),
                    _ => unresolved(&fields, scope),
                })
            }
            BinOp::Add | BinOp::Sub => return Err(CodegenError::NotACondition(node.to_string())),
        },
        Node::Between { field, low, high } => {
            let field = field.clone();
            let (low, high) = (low.to_value(), high.to_value());
            Arc::new(move |scope: &Scope<'_>| {
                let Some(value) = scope.present(&field) else {
                    return Truth::Unknown;
                };
                match (value.compare(&low), value.compare(&high)) {
                    (Some(lo), Some(hi)) => {
                        Truth::from_bool(lo != Ordering::Less && hi != Ordering::Greater)
                    }
                    _ => Truth::False,
                }
            })
        }
        Node::InList { field, values } => {
            let field = field.clone();
            let values: Vec<FieldValue> = values.iter().map(Literal::to_value).collect();
            Arc::new(move |scope: &Scope<'_>| match scope.present(&field) {
                Some(value) => Truth::from_bool(
                    values
                        .iter()
                        .any(|candidate| value.loosely_equals(candidate) == Some(true)),
                ),
                None => Truth::Unknown,
            })
        }
        Node::Required { unless } => {
            let unless = unless.as_deref().map(compile_condition).transpose()?;
            Arc::new(move |scope: &Scope<'_>| {
                if !scope.value.is_blank() {
                    return Truth::True;
                }
                match &unless {
                    Some(unless) => unless(scope),
                    None => Truth::False,
                }
            })
        }
        Node::Conditional {
            condition,
            then,
            otherwise,
        } => {
            let condition = compile_condition(condition)?;
            let then = compile_condition(then)?;
            let otherwise = otherwise.as_deref().map(compile_condition).transpose()?;
            Arc::new(move |scope: &Scope<'_>| match condition(scope) {
                Truth::True => then(scope),
                Truth::False => match &otherwise {
                    Some(otherwise) => otherwise(scope),
                    None => Truth::True,
                },
                Truth::Unknown => Truth::Unknown,
            })
        }
        Node::WithinDays { field, days, of } => {
            let field = field.clone();
            let days = *days;
            let target_fields = operand_fields(of);
            let of = compile_value(of)?;
            Arc::new(move |scope: &Scope<'_>| {
                let Some(value) = scope.present(&field) else {
                    return Truth::Unknown;
                };
                let Some(target) = of(scope) else {
                    return unresolved(&target_fields, scope);
                };
                match (value.as_date(), target.as_date()) {
                    (Some(date), Some(target)) => Truth::from_bool(
                        date.signed_duration_since(target).num_days().abs() <= days,
                    ),
                    _ => Truth::False,
                }
            })
        }
        Node::Literal(_) | Node::FieldRef(_) | Node::FunctionCall { .. } => {
            return Err(CodegenError::NotACondition(node.to_string()))
        }
    };
    Ok(condition)
}

fn compile_value(node: &Node) -> Result<ValueFn, CodegenError> {
    let value: ValueFn = match node {
        Node::Literal(literal) => {
            let value = literal.to_value();
            Arc::new(move |_: &Scope<'_>| Some(value.clone()))
        }
        Node::FieldRef(path) => {
            let path = path.clone();
            Arc::new(move |scope: &Scope<'_>| scope.present(&path))
        }
        Node::BinaryOp { op, left, right } => match op {
            BinOp::Add | BinOp::Sub => {
                let op = *op;
                let (left, right) = (compile_value(left)?, compile_value(right)?);
                Arc::new(move |scope: &Scope<'_>| {
                    arithmetic(op, &left(scope)?, &right(scope)?)
                })
            }
            BinOp::Eq
            | BinOp::NotEq
            | BinOp::Gt
            | BinOp::Lt
            | BinOp::Gte
            | BinOp::Lte
            | BinOp::And
            | BinOp::Or => return Err(CodegenError::NotAValue(node.to_string())),
        },
        Node::FunctionCall { function, args } => compile_function(*function, args)?,
        Node::Between { .. }
        | Node::InList { .. }
        | Node::Required { .. }
        | Node::Conditional { .. }
        | Node::WithinDays { .. } => return Err(CodegenError::NotAValue(node.to_string())),
    };
    Ok(value)
}

fn compile_function(function: ClinicalFunction, args: &[Node]) -> Result<ValueFn, CodegenError> {
    if args.len() != function.arity() {
        return Err(CodegenError::Arity {
            function: function.name(),
            expected: function.arity(),
            found: args.len(),
        });
    }
    let mut args = args
        .iter()
        .map(compile_value)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    let value: ValueFn = match function {
        ClinicalFunction::Length => {
            let Some(arg) = args.next() else {
                return Err(CodegenError::Arity {
                    function: function.name(),
                    expected: 1,
                    found: 0,
                });
            };
            Arc::new(move |scope: &Scope<'_>| {
                let text = arg(scope)?.as_text()?;
                Some(FieldValue::Number(text.chars().count() as f64))
            })
        }
        ClinicalFunction::Today => {
            Arc::new(|scope: &Scope<'_>| Some(FieldValue::Date(scope.today)))
        }
        ClinicalFunction::AddDays => {
            let (Some(date), Some(days)) = (args.next(), args.next()) else {
                return Err(CodegenError::Arity {
                    function: function.name(),
                    expected: 2,
                    found: 0,
                });
            };
            Arc::new(move |scope: &Scope<'_>| {
                let date = date(scope)?.as_date()?;
                shift_days(date, days(scope)?.as_number()?)
            })
        }
    };
    Ok(value)
}

fn operand_fields(node: &Node) -> Vec<FieldPath> {
    node.field_refs().into_iter().cloned().collect()
}

/// An operand produced no value. Unknown while one of its fields is missing;
/// otherwise the data is there but has the wrong shape, and the check fails.
fn unresolved(fields: &[FieldPath], scope: &Scope<'_>) -> Truth {
    if fields.iter().any(|path| scope.present(path).is_none()) {
        Truth::Unknown
    } else {
        Truth::False
    }
}

/// Both operands are present here, so a pair that cannot be coerced to a
/// common kind fails every comparison, `!=` included.
fn compare(op: BinOp, a: &FieldValue, b: &FieldValue) -> Truth {
    let Some(ordering) = a.compare(b) else {
        return Truth::False;
    };
    match op {
        BinOp::Eq => Truth::from_bool(ordering == Ordering::Equal),
        BinOp::NotEq => Truth::from_bool(ordering != Ordering::Equal),
        BinOp::Gt => Truth::from_bool(ordering == Ordering::Greater),
        BinOp::Lt => Truth::from_bool(ordering == Ordering::Less),
        BinOp::Gte => Truth::from_bool(ordering != Ordering::Less),
        BinOp::Lte => Truth::from_bool(ordering != Ordering::Greater),
        BinOp::And | BinOp::Or | BinOp::Add | BinOp::Sub => Truth::Unknown,
    }
}

/// `date + n` shifts by days, `date - date` yields days, numbers add up.
fn arithmetic(op: BinOp, left: &FieldValue, right: &FieldValue) -> Option<FieldValue> {
    match op {
        BinOp::Add => match (left.as_date(), right.as_date()) {
            (Some(date), None) => shift_days(date, right.as_number()?),
            (None, Some(date)) => shift_days(date, left.as_number()?),
            (None, None) => Some(FieldValue::Number(left.as_number()? + right.as_number()?)),
            (Some(_), Some(_)) => None,
        },
        BinOp::Sub => match (left.as_date(), right.as_date()) {
            (Some(a), Some(b)) => Some(FieldValue::Number(
                a.signed_duration_since(b).num_days() as f64,
            )),
            (Some(date), None) => shift_days(date, -right.as_number()?),
            (None, None) => Some(FieldValue::Number(left.as_number()? - right.as_number()?)),
            (None, Some(_)) => None,
        },
        _ => None,
    }
}

fn shift_days(date: NaiveDate, days: f64) -> Option<FieldValue> {
    if days.fract() != 0.0 {
        return None;
    }
    let delta = TimeDelta::try_days(days as i64)?;
    date.checked_add_signed(delta).map(FieldValue::Date)
}

/// The real-time artifact for one rule.
#[derive(Debug, Clone)]
pub struct CompiledValidator {
    pub rule_id: RuleId,
    pub form_id: String,
    pub field_name: String,
    pub severity: Severity,
    pub description: String,
    pub content_hash: String,
    referenced: Vec<FieldPath>,
    predicate: Predicate,
}

impl CompiledValidator {
    pub fn compile(rule: &Rule, node: &Node, content_hash: &str) -> Result<Self, CodegenError> {
        let mut referenced: Vec<FieldPath> = Vec::new();
        for path in node.field_refs() {
            if !referenced.contains(path) {
                referenced.push(path.clone());
            }
        }
        Ok(Self {
            rule_id: rule.id.clone(),
            form_id: rule.form_id.clone(),
            field_name: rule.field_name.clone(),
            severity: rule.severity,
            description: node.describe(&rule.field_name),
            content_hash: content_hash.to_string(),
            referenced,
            predicate: compile_predicate(node)?,
        })
    }

    /// Validate against today's local date.
    pub fn validate(&self, value: &FieldValue, record: &RecordContext) -> ValidationResult {
        self.validate_at(value, record, Local::now().date_naive())
    }

    pub fn validate_at(
        &self,
        value: &FieldValue,
        record: &RecordContext,
        today: NaiveDate,
    ) -> ValidationResult {
        let scope = Scope::new(&self.field_name, value, record, today);
        match self.predicate.evaluate(&scope) {
            Truth::True => ValidationResult::Valid,
            Truth::False => ValidationResult::Invalid(self.description.clone()),
            Truth::Unknown => {
                let missing: Vec<String> = self
                    .referenced
                    .iter()
                    .filter(|path| scope.present(path).is_none())
                    .map(ToString::to_string)
                    .collect();
                debug!(
                    rule_id = %self.rule_id,
                    field = %self.field_name,
                    missing = ?missing,
                    "rule indeterminate, referenced field missing"
                );
                ValidationResult::Indeterminate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rule;

    fn validator(field: &str, text: &str) -> CompiledValidator {
        let rule = Rule::new("R1", "DM", field, text);
        let node = parse_rule(text).unwrap();
        CompiledValidator::compile(&rule, &node, &rule.content_hash()).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(pairs: &[(&str, FieldValue)]) -> RecordContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn check(v: &CompiledValidator, value: FieldValue, ctx: &RecordContext) -> ValidationResult {
        v.validate_at(&value, ctx, date("2025-06-01"))
    }

    #[test]
    fn test_age_range() {
        let v = validator("age", "age between 18 and 65");
        let empty = RecordContext::new();
        assert_eq!(
            check(&v, 10_i64.into(), &empty),
            ValidationResult::Invalid("age must be between 18 and 65".to_string())
        );
        assert_eq!(check(&v, 30_i64.into(), &empty), ValidationResult::Valid);
        assert_eq!(check(&v, 65_i64.into(), &empty), ValidationResult::Valid);
        assert_eq!(check(&v, FieldValue::Null, &empty), ValidationResult::Indeterminate);
        assert_eq!(check(&v, "30".into(), &empty), ValidationResult::Valid);
    }

    #[test]
    fn test_unreadable_value_is_invalid() {
        let empty = RecordContext::new();
        let range = validator("age", "age between 18 and 65");
        assert!(!check(&range, "abc".into(), &empty).is_valid());

        let exact = validator("age", "age == 30");
        assert!(!check(&exact, "abc".into(), &empty).is_valid());
        let other = validator("age", "age != 30");
        assert!(!check(&other, "abc".into(), &empty).is_valid());
        let ordered = validator("age", "age >= 18");
        assert!(!check(&ordered, "abc".into(), &empty).is_valid());

        let window = validator("visit_date", "visit_date within 60 days of baseline_date + 365");
        let ctx = record(&[("baseline_date", date("2024-01-01").into())]);
        assert!(!check(&window, "not-a-date".into(), &ctx).is_valid());

        let bad_baseline = record(&[("baseline_date", "soon".into())]);
        assert!(!check(&window, date("2025-02-01").into(), &bad_baseline).is_valid());
    }

    #[test]
    fn test_visit_window() {
        let v = validator("visit_date", "visit_date within 60 days of baseline_date + 365");
        let ctx = record(&[("baseline_date", date("2024-01-01").into())]);

        let late = check(&v, date("2025-03-15").into(), &ctx);
        assert!(!late.is_valid());
        assert_eq!(
            late.message(),
            Some("visit_date must be within 60 days of baseline_date + 365")
        );
        assert_eq!(check(&v, date("2025-02-01").into(), &ctx), ValidationResult::Valid);
        assert_eq!(check(&v, "2025-02-01".into(), &ctx), ValidationResult::Valid);

        let no_baseline = RecordContext::new();
        assert_eq!(
            check(&v, date("2025-02-01").into(), &no_baseline),
            ValidationResult::Indeterminate
        );
    }

    #[test]
    fn test_required_unless() {
        let v = validator("consent_date", "required unless status == 'Withdrawn'");
        let enrolled = record(&[("status", "Enrolled".into())]);
        let withdrawn = record(&[("status", "Withdrawn".into())]);

        assert!(!check(&v, FieldValue::Null, &enrolled).is_valid());
        assert!(!check(&v, "  ".into(), &enrolled).is_valid());
        assert_eq!(check(&v, FieldValue::Null, &withdrawn), ValidationResult::Valid);
        assert_eq!(
            check(&v, date("2024-01-01").into(), &enrolled),
            ValidationResult::Valid
        );
        assert_eq!(
            check(&v, FieldValue::Null, &RecordContext::new()),
            ValidationResult::Indeterminate
        );
    }

    #[test]
    fn test_membership() {
        let v = validator("gender", "gender in (Male, Female, Other)");
        let empty = RecordContext::new();
        assert_eq!(check(&v, "Female".into(), &empty), ValidationResult::Valid);
        assert_eq!(
            check(&v, "Unknown".into(), &empty),
            ValidationResult::Invalid("gender must be one of 'Male', 'Female', 'Other'".to_string())
        );
    }

    #[test]
    fn test_conditional() {
        let v = validator("pregnant", "if sex == 'M' then pregnant == 'No' endif");
        let male = record(&[("sex", "M".into())]);
        let female = record(&[("sex", "F".into())]);
        assert!(!check(&v, "Yes".into(), &male).is_valid());
        assert_eq!(check(&v, "Yes".into(), &female), ValidationResult::Valid);
        assert_eq!(
            check(&v, "Yes".into(), &RecordContext::new()),
            ValidationResult::Indeterminate
        );
    }

    #[test]
    fn test_unknown_operand_does_not_hide_decisive_branch() {
        let v = validator("a", "a > 1 or b > 2");
        let ctx = record(&[("b", 3_i64.into())]);
        assert_eq!(check(&v, FieldValue::Null, &ctx), ValidationResult::Valid);

        let v = validator("a", "a > 1 and b > 2");
        let ctx = record(&[("b", 1_i64.into())]);
        assert!(!check(&v, FieldValue::Null, &ctx).is_valid());
    }

    #[test]
    fn test_functions() {
        let v = validator("initials", "length(initials) == 3");
        let empty = RecordContext::new();
        assert_eq!(check(&v, "ABC".into(), &empty), ValidationResult::Valid);
        assert!(!check(&v, "AB".into(), &empty).is_valid());

        let v = validator("visit_date", "visit_date <= add_days(today(), 7)");
        assert_eq!(
            check(&v, date("2025-06-08").into(), &empty),
            ValidationResult::Valid
        );
        assert!(!check(&v, date("2025-06-09").into(), &empty).is_valid());
    }

    #[test]
    fn test_visit_qualified_reference() {
        let v = validator("weight", "weight <= previous.weight + 10");
        let ctx = record(&[("previous.weight", 70_i64.into())]);
        assert_eq!(check(&v, 75_i64.into(), &ctx), ValidationResult::Valid);
        assert!(!check(&v, 85_i64.into(), &ctx).is_valid());
        assert_eq!(
            check(&v, 85_i64.into(), &RecordContext::new()),
            ValidationResult::Indeterminate
        );
    }

    #[test]
    fn test_date_difference() {
        let v = validator("end_date", "end_date - start_date >= 0");
        let ctx = record(&[("start_date", date("2025-01-10").into())]);
        assert_eq!(check(&v, date("2025-01-10").into(), &ctx), ValidationResult::Valid);
        assert!(!check(&v, date("2025-01-09").into(), &ctx).is_valid());
    }

    #[test]
    fn test_indeterminate_policy() {
        let result = ValidationResult::Indeterminate;
        assert!(result.is_valid());
        assert!(result.passes(IndeterminatePolicy::Pass));
        assert!(!result.passes(IndeterminatePolicy::Block));
        assert!(!ValidationResult::Invalid("x".into()).passes(IndeterminatePolicy::Pass));
    }

    #[test]
    fn test_value_nodes_are_not_predicates() {
        let node = Node::FieldRef(FieldPath::current("age"));
        assert_eq!(
            compile_predicate(&node).unwrap_err(),
            CodegenError::NotACondition("age".to_string())
        );
    }
}
