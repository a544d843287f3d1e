//! SQL compiler that converts a rule AST into a parameterized violation query using sea-query.
//!
//! The generated statement selects the rows on which the rule is *violated*.
//! Negation is pushed down to the leaves instead of wrapping the rule in
//! `NOT (...)`, so every comparison keeps SQL's three-valued semantics: a
//! NULL operand makes the predicate NULL and the row is excluded, exactly
//! like an `Indeterminate` real-time result. Only `required` inspects
//! nulls explicitly.
//!
//! Columns compared against numbers or dates are read through a shape check
//! and converted only when they match, so one bad row never aborts the
//! statement. A present value of the wrong shape is reported as a violation,
//! matching the real-time verdict for the same value.

use crate::ast::{BinOp, FieldPath, Literal, Node, VisitRef};
use crate::config::{EngineConfig, TableMappingConfig};
use crate::functions::ClinicalFunction;
use crate::rule::{Rule, RuleId, Severity};
use crate::value::ValueKind;
use sea_query::{
    Alias, Asterisk, BinOper, Expr, Func, Iden, JoinType, Keyword, Order, PostgresQueryBuilder,
    Query, SelectStatement, SimpleExpr, SqliteQueryBuilder, Value, Values,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write;
use thiserror::Error;

/// Target database flavour. Selects placeholder style and date functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    Sqlite,
}

/// Represents a table alias for sea-query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableAlias {
    Base,
    PreviousVisit,
    FirstVisit,
    /// Inner alias of the correlated visit-ordering subquery.
    Ordering,
}

impl TableAlias {
    fn for_visit(visit: VisitRef) -> Self {
        match visit {
            VisitRef::Current => TableAlias::Base,
            VisitRef::Previous => TableAlias::PreviousVisit,
            VisitRef::First => TableAlias::FirstVisit,
        }
    }
}

impl Iden for TableAlias {
    fn unquoted(&self, s: &mut dyn Write) {
        let name = match self {
            TableAlias::Base => "base",
            TableAlias::PreviousVisit => "previous_visit",
            TableAlias::FirstVisit => "first_visit",
            TableAlias::Ordering => "visit_order",
        };
        write!(s, "{}", name).unwrap();
    }
}

/// Table identifier wrapper
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
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
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
}

/// A self-join required by a visit-qualified field reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub alias: String,
    pub visit: VisitRef,
    pub table: String,
    /// Column the join is keyed on.
    pub subject_column: String,
    /// Column whose MIN/MAX picks the joined visit.
    pub visit_column: String,
}

/// The batch artifact for one rule.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub rule_id: RuleId,
    pub form_id: String,
    pub field_name: String,
    pub severity: Severity,
    pub dialect: SqlDialect,
    /// Violation query. Yields `subject_id`, `visit_number`, `actual_value`.
    pub sql_template: String,
    pub bind_parameters: Values,
    /// `SELECT COUNT(*)` over the target table.
    pub count_sql: String,
    pub count_parameters: Values,
    pub target_table: String,
    pub join_spec: Vec<JoinSpec>,
    pub content_hash: String,
    pub expected_description: String,
}

/// Type hint threaded through value compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Hint {
    Plain,
    Number,
    Date,
}

impl Hint {
    fn of(kinds: &[ValueKind]) -> Self {
        if kinds.contains(&ValueKind::Date) {
            Hint::Date
        } else if kinds.contains(&ValueKind::Number) {
            Hint::Number
        } else {
            Hint::Plain
        }
    }
}

const PG_NUMBER_PATTERN: &str = r"^[+-]?([0-9]+[.]?[0-9]*|[.][0-9]+)([eE][+-]?[0-9]+)?$";
const PG_DATE_PATTERN: &str = r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$";
const SQLITE_DIGIT_GLOB: &str = "*[0-9]*";
const SQLITE_NON_NUMERIC_GLOB: &str = "*[^0-9.eE+-]*";
const SQLITE_DATE_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]";

/// SQL Compiler that converts rule ASTs to violation queries.
///
/// Two compilers that compare equal produce identical queries for the same rule.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCompiler {
    dialect: SqlDialect,
    subject_column: String,
    visit_column: String,
    /// Maps form ids to table names for schema resolution
    table_mapping: TableMappingConfig,
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new(SqlDialect::default())
    }
}

impl SqlCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            subject_column: "subject_id".to_string(),
            visit_column: "visit_number".to_string(),
            table_mapping: TableMappingConfig::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            dialect: config.dialect,
            subject_column: config.subject_column.clone(),
            visit_column: config.visit_column.clone(),
            table_mapping: config.table_mapping.clone(),
        }
    }

    /// Set table mapping for form ids
    pub fn set_table_mapping(&mut self, mapping: TableMappingConfig) {
        self.table_mapping = mapping;
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Compile a parsed rule into its violation query
    pub fn compile(
        &self,
        rule: &Rule,
        node: &Node,
        content_hash: &str,
    ) -> Result<CompiledQuery, CompileError> {
        let table = identifier(self.table_mapping.get_table_name(&rule.form_id))?;
        let subject = identifier(self.subject_column.clone())?;
        let visit = identifier(self.visit_column.clone())?;
        let field = identifier(rule.field_name.clone())?;

        let mut generator = Generator {
            dialect: self.dialect,
            field: field.clone(),
            joins: BTreeSet::new(),
            typed_reads: BTreeSet::new(),
        };
        let violated = generator.violated(node)?;

        let mut select = Query::select();
        select
            .expr_as(
                text(Expr::col((TableAlias::Base, ColumnName(subject.clone())))),
                Alias::new("subject_id"),
            )
            .expr_as(
                text(Expr::col((TableAlias::Base, ColumnName(visit.clone())))),
                Alias::new("visit_number"),
            )
            .expr_as(
                text(Expr::col((TableAlias::Base, ColumnName(field.clone())))),
                Alias::new("actual_value"),
            )
            .from_as(TableName(table.clone()), TableAlias::Base);

        let mut join_spec = Vec::new();
        for visit_ref in &generator.joins {
            let alias = TableAlias::for_visit(*visit_ref);
            select.join_as(
                JoinType::LeftJoin,
                TableName(table.clone()),
                alias,
                self.join_condition(*visit_ref, alias, &table, &subject, &visit),
            );
            join_spec.push(JoinSpec {
                alias: alias.to_string(),
                visit: *visit_ref,
                table: table.clone(),
                subject_column: subject.clone(),
                visit_column: visit.clone(),
            });
        }

        select
            .and_where(violated)
            .order_by((TableAlias::Base, ColumnName(subject.clone())), Order::Asc)
            .order_by((TableAlias::Base, ColumnName(visit.clone())), Order::Asc);

        let mut count = Query::select();
        count
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("row_count"))
            .from(TableName(table.clone()));

        let (sql_template, bind_parameters) = self.build(&select);
        let (count_sql, count_parameters) = self.build(&count);

        Ok(CompiledQuery {
            rule_id: rule.id.clone(),
            form_id: rule.form_id.clone(),
            field_name: rule.field_name.clone(),
            severity: rule.severity,
            dialect: self.dialect,
            sql_template,
            bind_parameters,
            count_sql,
            count_parameters,
            target_table: table,
            join_spec,
            content_hash: content_hash.to_string(),
            expected_description: node.describe(&rule.field_name),
        })
    }

    fn build(&self, select: &SelectStatement) -> (String, Values) {
        match self.dialect {
            SqlDialect::Postgres => select.build(PostgresQueryBuilder),
            SqlDialect::Sqlite => select.build(SqliteQueryBuilder),
        }
    }

    /// `alias.subject = base.subject AND alias.visit IN (SELECT MAX|MIN(visit) ...)`
    fn join_condition(
        &self,
        visit_ref: VisitRef,
        alias: TableAlias,
        table: &str,
        subject: &str,
        visit: &str,
    ) -> SimpleExpr {
        let ordering_visit = Expr::col((TableAlias::Ordering, ColumnName(visit.to_string())));
        let mut ordering = Query::select();
        ordering
            .from_as(TableName(table.to_string()), TableAlias::Ordering)
            .and_where(
                Expr::col((TableAlias::Ordering, ColumnName(subject.to_string())))
                    .equals((TableAlias::Base, ColumnName(subject.to_string()))),
            );
        match visit_ref {
            VisitRef::Previous => {
                ordering.expr(Func::max(ordering_visit.clone())).and_where(
                    ordering_visit.lt(Expr::col((TableAlias::Base, ColumnName(visit.to_string())))),
                );
            }
            VisitRef::First | VisitRef::Current => {
                ordering.expr(Func::min(ordering_visit));
            }
        }

        Expr::col((alias, ColumnName(subject.to_string())))
            .equals((TableAlias::Base, ColumnName(subject.to_string())))
            .and(Expr::col((alias, ColumnName(visit.to_string()))).in_subquery(ordering))
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`.
fn identifier(name: String) -> Result<String, CompileError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(CompileError::InvalidIdentifier(name))
    }
}

fn text<T: Into<SimpleExpr>>(expr: T) -> SimpleExpr {
    Func::cast_as(expr, Alias::new("TEXT")).into()
}

/// `TRIM(CAST(x AS TEXT))`
fn trimmed_text(expr: SimpleExpr) -> SimpleExpr {
    Func::cust(Alias::new("TRIM")).arg(text(expr)).into()
}

fn custom(left: SimpleExpr, op: &'static str, pattern: &str) -> SimpleExpr {
    Expr::expr(left).binary(BinOper::Custom(op), Expr::val(pattern))
}

fn constant(value: bool) -> SimpleExpr {
    SimpleExpr::Constant(Value::Bool(Some(value)))
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Integer(n) => (*n).into(),
        Literal::Decimal(n) => (*n).into(),
        Literal::String(s) => s.clone().into(),
        Literal::Date(d) => (*d).into(),
    }
}

/// Per-rule walk state.
struct Generator {
    dialect: SqlDialect,
    /// Column the rule is bound to, target of `required`.
    field: String,
    joins: BTreeSet<VisitRef>,
    /// Columns read as numbers or dates by the leaf being compiled.
    typed_reads: BTreeSet<(VisitRef, String, Hint)>,
}

impl Generator {
    /// Predicate that is TRUE where the rule holds.
    fn holds(&mut self, node: &Node) -> Result<SimpleExpr, CompileError> {
        let expr = match node {
            Node::BinaryOp { op, left, right } => match op {
                BinOp::And => self.holds(left)?.and(self.holds(right)?),
                BinOp::Or => self.holds(left)?.or(self.holds(right)?),
                BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => {
                    self.comparison(*op, left, right)?
                }
                BinOp::Add | BinOp::Sub => {
                    return Err(CompileError::NotACondition(node.to_string()))
                }
            },
            Node::Between { field, low, high } => {
                let hint = Hint::of(&[low.kind(), high.kind()]);
                let column = self.field_value(field, hint)?;
                Expr::expr(column.clone())
                    .gte(literal_value(low))
                    .and(Expr::expr(column).lte(literal_value(high)))
            }
            Node::InList { field, values } => {
                let column = self.field_value(field, Hint::of(&list_kinds(values)))?;
                Expr::expr(column).is_in(values.iter().map(literal_value))
            }
            Node::Required { unless } => {
                let present = Expr::expr(self.blank_checked()).ne("");
                match unless {
                    Some(unless) => present.or(self.holds(unless)?),
                    None => present,
                }
            }
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let otherwise = match otherwise {
                    Some(otherwise) => self.holds(otherwise)?,
                    None => constant(true),
                };
                Expr::case(self.holds(condition)?, self.holds(then)?)
                    .case(self.violated(condition)?, otherwise)
                    .finally(SimpleExpr::Keyword(Keyword::Null))
                    .into()
            }
            Node::WithinDays { field, days, of } => {
                Expr::expr(self.day_distance(field, of)?).lte(*days)
            }
            Node::Literal(_) | Node::FieldRef(_) | Node::FunctionCall { .. } => {
                return Err(CompileError::NotACondition(node.to_string()))
            }
        };
        Ok(expr)
    }

    /// Predicate that is TRUE where the rule is violated.
    fn violated(&mut self, node: &Node) -> Result<SimpleExpr, CompileError> {
        let expr = match node {
            Node::BinaryOp { op, left, right } => match op {
                BinOp::And => self.violated(left)?.or(self.violated(right)?),
                BinOp::Or => self.violated(left)?.and(self.violated(right)?),
                BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => {
                    let negated = op
                        .negated()
                        .ok_or_else(|| CompileError::NotACondition(node.to_string()))?;
                    self.typed_reads.clear();
                    let expr = self.comparison(negated, left, right)?;
                    self.or_malformed(expr)
                }
                BinOp::Add | BinOp::Sub => {
                    return Err(CompileError::NotACondition(node.to_string()))
                }
            },
            Node::Between { field, low, high } => {
                let hint = Hint::of(&[low.kind(), high.kind()]);
                self.typed_reads.clear();
                let column = self.field_value(field, hint)?;
                let expr = Expr::expr(column.clone())
                    .lt(literal_value(low))
                    .or(Expr::expr(column).gt(literal_value(high)));
                self.or_malformed(expr)
            }
            Node::InList { field, values } => {
                self.typed_reads.clear();
                let column = self.field_value(field, Hint::of(&list_kinds(values)))?;
                let expr = Expr::expr(column).is_not_in(values.iter().map(literal_value));
                self.or_malformed(expr)
            }
            Node::Required { unless } => {
                let absent = Expr::expr(self.blank_checked()).eq("");
                match unless {
                    Some(unless) => absent.and(self.violated(unless)?),
                    None => absent,
                }
            }
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let otherwise = match otherwise {
                    Some(otherwise) => self.violated(otherwise)?,
                    None => constant(false),
                };
                Expr::case(self.holds(condition)?, self.violated(then)?)
                    .case(self.violated(condition)?, otherwise)
                    .finally(constant(false))
                    .into()
            }
            Node::WithinDays { field, days, of } => {
                self.typed_reads.clear();
                let expr = Expr::expr(self.day_distance(field, of)?).gt(*days);
                self.or_malformed(expr)
            }
            Node::Literal(_) | Node::FieldRef(_) | Node::FunctionCall { .. } => {
                return Err(CompileError::NotACondition(node.to_string()))
            }
        };
        Ok(expr)
    }

    fn comparison(
        &mut self,
        op: BinOp,
        left: &Node,
        right: &Node,
    ) -> Result<SimpleExpr, CompileError> {
        let hint = Hint::of(&[left.static_kind(), right.static_kind()]);
        let left = Expr::expr(self.value(left, hint)?);
        let right = self.value(right, hint)?;
        let expr = match op {
            BinOp::Eq => left.eq(right),
            BinOp::NotEq => left.ne(right),
            BinOp::Gt => left.gt(right),
            BinOp::Lt => left.lt(right),
            BinOp::Gte => left.gte(right),
            BinOp::Lte => left.lte(right),
            BinOp::And | BinOp::Or | BinOp::Add | BinOp::Sub => {
                return Err(CompileError::NotAValue(op.symbol().to_string()))
            }
        };
        Ok(expr)
    }

    /// `COALESCE(TRIM(CAST(field AS TEXT)), '')`
    fn blank_checked(&self) -> SimpleExpr {
        let column = Expr::col((TableAlias::Base, ColumnName(self.field.clone())));
        Func::coalesce([
            Func::cust(Alias::new("TRIM")).arg(text(column)).into(),
            Expr::val("").into(),
        ])
        .into()
    }

    /// `ABS(field - target)` in days.
    fn day_distance(&mut self, field: &FieldPath, of: &Node) -> Result<SimpleExpr, CompileError> {
        let field = self.field_value(field, Hint::Date)?;
        let target = self.value(of, Hint::Date)?;
        Ok(Func::abs(self.date_difference(field, target)).into())
    }

    fn column(&mut self, path: &FieldPath) -> Result<SimpleExpr, CompileError> {
        let name = identifier(path.name.clone())?;
        if path.visit != VisitRef::Current {
            self.joins.insert(path.visit);
        }
        Ok(Expr::col((TableAlias::for_visit(path.visit), ColumnName(name))).into())
    }

    fn field_value(&mut self, path: &FieldPath, hint: Hint) -> Result<SimpleExpr, CompileError> {
        let column = self.column(path)?;
        if hint == Hint::Plain {
            return Ok(column);
        }
        self.typed_reads.insert((path.visit, path.name.clone(), hint));
        let trimmed = trimmed_text(column);
        let converted = match hint {
            Hint::Date => self.as_date(trimmed.clone()),
            Hint::Number | Hint::Plain => self.as_number(trimmed.clone()),
        };
        Ok(Expr::case(self.well_formed(trimmed, hint), converted).into())
    }

    /// Adds `OR <column is present but unreadable>` for every typed read of the leaf.
    fn or_malformed(&mut self, expr: SimpleExpr) -> SimpleExpr {
        let reads = std::mem::take(&mut self.typed_reads);
        reads.into_iter().fold(expr, |expr, (visit, name, hint)| {
            let column = Expr::col((TableAlias::for_visit(visit), ColumnName(name))).into();
            let trimmed = trimmed_text(column);
            let present = Expr::expr(trimmed.clone()).ne("");
            expr.or(present.and(self.ill_formed(trimmed, hint)))
        })
    }

    fn well_formed(&self, trimmed: SimpleExpr, hint: Hint) -> SimpleExpr {
        match (self.dialect, hint) {
            (_, Hint::Plain) => constant(true),
            (SqlDialect::Postgres, Hint::Number) => custom(trimmed, "~", PG_NUMBER_PATTERN),
            (SqlDialect::Postgres, Hint::Date) => custom(trimmed, "~", PG_DATE_PATTERN),
            (SqlDialect::Sqlite, Hint::Number) => custom(trimmed.clone(), "GLOB", SQLITE_DIGIT_GLOB)
                .and(custom(trimmed, "NOT GLOB", SQLITE_NON_NUMERIC_GLOB)),
            (SqlDialect::Sqlite, Hint::Date) => custom(trimmed, "GLOB", SQLITE_DATE_GLOB),
        }
    }

    fn ill_formed(&self, trimmed: SimpleExpr, hint: Hint) -> SimpleExpr {
        match (self.dialect, hint) {
            (_, Hint::Plain) => constant(false),
            (SqlDialect::Postgres, Hint::Number) => custom(trimmed, "!~", PG_NUMBER_PATTERN),
            (SqlDialect::Postgres, Hint::Date) => custom(trimmed, "!~", PG_DATE_PATTERN),
            (SqlDialect::Sqlite, Hint::Number) => {
                custom(trimmed.clone(), "NOT GLOB", SQLITE_DIGIT_GLOB)
                    .or(custom(trimmed, "GLOB", SQLITE_NON_NUMERIC_GLOB))
            }
            (SqlDialect::Sqlite, Hint::Date) => custom(trimmed, "NOT GLOB", SQLITE_DATE_GLOB),
        }
    }

    fn value(&mut self, node: &Node, hint: Hint) -> Result<SimpleExpr, CompileError> {
        let expr = match node {
            Node::Literal(literal) => Expr::val(literal_value(literal)).into(),
            Node::FieldRef(path) => self.field_value(path, hint)?,
            Node::BinaryOp { op, left, right } => match op {
                BinOp::Add | BinOp::Sub => self.arithmetic(node, *op, left, right, hint)?,
                BinOp::Eq
                | BinOp::NotEq
                | BinOp::Gt
                | BinOp::Lt
                | BinOp::Gte
                | BinOp::Lte
                | BinOp::And
                | BinOp::Or => return Err(CompileError::NotAValue(node.to_string())),
            },
            Node::FunctionCall { function, args } => self.function(*function, args)?,
            Node::Between { .. }
            | Node::InList { .. }
            | Node::Required { .. }
            | Node::Conditional { .. }
            | Node::WithinDays { .. } => return Err(CompileError::NotAValue(node.to_string())),
        };
        Ok(expr)
    }

    fn arithmetic(
        &mut self,
        node: &Node,
        op: BinOp,
        left: &Node,
        right: &Node,
        hint: Hint,
    ) -> Result<SimpleExpr, CompileError> {
        let (left_kind, right_kind) = (left.static_kind(), right.static_kind());
        let date_result = hint == Hint::Date || node.static_kind() == ValueKind::Date;
        let expr = match op {
            BinOp::Sub if left_kind == ValueKind::Date && right_kind == ValueKind::Date => {
                let (a, b) = (self.value(left, Hint::Date)?, self.value(right, Hint::Date)?);
                self.date_difference(a, b)
            }
            BinOp::Add if date_result && right_kind == ValueKind::Date => {
                let date = self.value(right, Hint::Date)?;
                let days = self.value(left, Hint::Number)?;
                self.add_days(date, days)
            }
            BinOp::Add if date_result => {
                let date = self.value(left, Hint::Date)?;
                let days = self.value(right, Hint::Number)?;
                self.add_days(date, days)
            }
            BinOp::Sub if date_result => {
                let date = self.value(left, Hint::Date)?;
                let days = Expr::expr(self.value(right, Hint::Number)?).mul(-1);
                self.add_days(date, days)
            }
            BinOp::Add => {
                let operand = Hint::of(&[left_kind, right_kind]);
                let (a, b) = (self.value(left, operand)?, self.value(right, operand)?);
                Expr::expr(a).add(b)
            }
            BinOp::Sub => {
                let operand = Hint::of(&[left_kind, right_kind]);
                let (a, b) = (self.value(left, operand)?, self.value(right, operand)?);
                Expr::expr(a).sub(b)
            }
            _ => return Err(CompileError::NotAValue(node.to_string())),
        };
        Ok(expr)
    }

    fn function(
        &mut self,
        function: ClinicalFunction,
        args: &[Node],
    ) -> Result<SimpleExpr, CompileError> {
        let arity_error = || CompileError::Arity {
            function: function.name(),
            expected: function.arity(),
            found: args.len(),
        };
        if args.len() != function.arity() {
            return Err(arity_error());
        }
        let expr = match function {
            ClinicalFunction::Length => {
                let arg = args.first().ok_or_else(arity_error)?;
                let value = self.value(arg, Hint::Plain)?;
                Func::cust(Alias::new("LENGTH")).arg(text(value)).into()
            }
            ClinicalFunction::Today => SimpleExpr::Keyword(Keyword::CurrentDate),
            ClinicalFunction::AddDays => {
                let (date, days) = match args {
                    [date, days] => (date, days),
                    _ => return Err(arity_error()),
                };
                let date = self.value(date, Hint::Date)?;
                let days = self.value(days, Hint::Number)?;
                self.add_days(date, days)
            }
        };
        Ok(expr)
    }

    /// PostgreSQL `CAST(x AS DATE)`, SQLite `date(x)`.
    fn as_date(&self, expr: SimpleExpr) -> SimpleExpr {
        match self.dialect {
            SqlDialect::Postgres => Func::cast_as(expr, Alias::new("DATE")).into(),
            SqlDialect::Sqlite => Func::cust(Alias::new("date")).arg(expr).into(),
        }
    }

    /// PostgreSQL `CAST(x AS NUMERIC)`, SQLite `CAST(x AS REAL)`.
    fn as_number(&self, expr: SimpleExpr) -> SimpleExpr {
        let target = match self.dialect {
            SqlDialect::Postgres => "NUMERIC",
            SqlDialect::Sqlite => "REAL",
        };
        Func::cast_as(expr, Alias::new(target)).into()
    }

    fn add_days(&self, date: SimpleExpr, days: SimpleExpr) -> SimpleExpr {
        match self.dialect {
            SqlDialect::Postgres => Expr::expr(date).add(Func::cast_as(days, Alias::new("INTEGER"))),
            SqlDialect::Sqlite => {
                let julian = Func::cust(Alias::new("julianday")).arg(date);
                Func::cust(Alias::new("date"))
                    .arg(Expr::expr(julian).add(days))
                    .into()
            }
        }
    }

    /// Whole days from `b` to `a`.
    fn date_difference(&self, a: SimpleExpr, b: SimpleExpr) -> SimpleExpr {
        match self.dialect {
            SqlDialect::Postgres => Expr::expr(a).sub(b),
            SqlDialect::Sqlite => Expr::expr(Func::cust(Alias::new("julianday")).arg(a))
                .sub(Func::cust(Alias::new("julianday")).arg(b)),
        }
    }
}

fn list_kinds(values: &[Literal]) -> Vec<ValueKind> {
    values.iter().map(Literal::kind).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rule;

    fn compile_with(dialect: SqlDialect, field: &str, text: &str) -> CompiledQuery {
        let mut compiler = SqlCompiler::new(dialect);
        let mut mapping = TableMappingConfig::default();
        mapping
            .mappings
            .insert("COG".to_string(), "cognitive_assessments".to_string());
        compiler.set_table_mapping(mapping);
        let rule = Rule::new("COG-01", "COG", field, text);
        let node = parse_rule(text).unwrap();
        compiler.compile(&rule, &node, &rule.content_hash()).unwrap()
    }

    fn compile(field: &str, text: &str) -> CompiledQuery {
        compile_with(SqlDialect::Postgres, field, text)
    }

    #[test]
    fn test_range_rule_selects_out_of_range_rows() {
        let query = compile("mmse_total", "mmse_total between 0 and 30");
        assert!(query
            .sql_template
            .contains(r#"CAST(TRIM(CAST("base"."mmse_total" AS TEXT)) AS NUMERIC)"#));
        assert!(query.sql_template.contains(" < $"));
        assert!(query.sql_template.contains(" > $"));
        let bound = &query.bind_parameters.0;
        assert!(bound.contains(&Value::BigInt(Some(0))));
        assert!(bound.contains(&Value::BigInt(Some(30))));
        assert!(query.sql_template.contains(r#"FROM "cognitive_assessments" AS "base""#));
        assert_eq!(query.target_table, "cognitive_assessments");
        assert!(query.join_spec.is_empty());
        assert_eq!(query.expected_description, "mmse_total must be between 0 and 30");
    }

    #[test]
    fn test_values_are_never_interpolated() {
        let query = compile("site", "site in (\"A'; DROP TABLE x; --\", 'B')");
        assert!(!query.sql_template.contains("DROP TABLE"));
        assert!(query.sql_template.contains("NOT IN ($1, $2)"));
    }

    #[test]
    fn test_negation_is_pushed_down() {
        let query = compile("a", "a > 1 and b <= 2");
        assert!(query.sql_template.contains(" <= $"));
        assert!(query.sql_template.contains(" > $"));
        assert!(!query.sql_template.contains(" >= $"));
        assert!(!query.sql_template.contains("NOT ("));
    }

    #[test]
    fn test_required_treats_blank_as_violation() {
        let query = compile("consent_date", "required unless status == 'Withdrawn'");
        assert!(query.sql_template.contains("COALESCE(TRIM(CAST("));
        assert!(query.sql_template.contains(r#""base"."status" <> $"#));
    }

    #[test]
    fn test_previous_visit_self_join() {
        let query = compile("weight", "weight <= previous.weight + 10");
        assert_eq!(query.join_spec.len(), 1);
        assert_eq!(query.join_spec[0].visit, VisitRef::Previous);
        assert_eq!(query.join_spec[0].alias, "previous_visit");
        assert!(query.sql_template.contains(
            r#"LEFT JOIN "cognitive_assessments" AS "previous_visit""#
        ));
        assert!(query.sql_template.contains("MAX("));
        assert!(query
            .sql_template
            .contains(r#"CAST(TRIM(CAST("previous_visit"."weight" AS TEXT)) AS NUMERIC)"#));
        assert!(query.sql_template.contains(" > ("));
    }

    #[test]
    fn test_first_visit_join_uses_min() {
        let query = compile("visit_date", "visit_date within 30 days of first.visit_date");
        assert_eq!(query.join_spec[0].visit, VisitRef::First);
        assert!(query.sql_template.contains("MIN("));
    }

    #[test]
    fn test_within_days_dialects() {
        let pg = compile("visit_date", "visit_date within 60 days of baseline_date + 365");
        assert!(pg.sql_template.contains("ABS("));
        assert!(pg.sql_template.contains("AS DATE)"));

        let lite = compile_with(
            SqlDialect::Sqlite,
            "visit_date",
            "visit_date within 60 days of baseline_date + 365",
        );
        assert!(lite.sql_template.contains("julianday("));
        assert!(lite.sql_template.contains('?'));
        assert!(!lite.sql_template.contains('$'));
    }

    #[test]
    fn test_numeric_columns_are_cast_and_shape_checked() {
        let pg = compile("mmse_total", "mmse_total >= 0");
        assert!(pg.sql_template.contains(" ~ $"));
        assert!(pg.sql_template.contains(" !~ $"));
        assert!(pg
            .bind_parameters
            .0
            .contains(&Value::String(Some(Box::new(PG_NUMBER_PATTERN.to_string())))));

        let lite = compile_with(SqlDialect::Sqlite, "mmse_total", "mmse_total >= 0");
        assert!(lite.sql_template.contains("AS REAL)"));
        assert!(lite.sql_template.contains(" NOT GLOB ?"));
    }

    #[test]
    fn test_text_comparison_stays_uncast() {
        let query = compile("status", "status == 'Withdrawn'");
        assert!(query.sql_template.contains(r#""base"."status" <> $1"#));
        assert!(!query.sql_template.contains("NUMERIC"));
    }

    #[test]
    fn test_today_is_database_current_date() {
        let query = compile("visit_date", "visit_date <= today()");
        assert!(query.sql_template.contains("CURRENT_DATE"));
    }

    #[test]
    fn test_count_statement() {
        let query = compile("mmse_total", "mmse_total between 0 and 30");
        assert!(query.count_sql.starts_with("SELECT COUNT(*)"));
        assert!(query.count_sql.contains(r#""cognitive_assessments""#));
    }

    #[test]
    fn test_unmapped_form_falls_back_to_lowercase() {
        let compiler = SqlCompiler::new(SqlDialect::Postgres);
        let rule = Rule::new("DM-01", "DM", "age", "age > 0");
        let node = parse_rule(&rule.rule_text).unwrap();
        let query = compiler.compile(&rule, &node, "h").unwrap();
        assert_eq!(query.target_table, "dm");
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let compiler = SqlCompiler::new(SqlDialect::Postgres);
        let rule = Rule::new("DM-01", "DM", "age\"; --", "required");
        let node = parse_rule(&rule.rule_text).unwrap();
        assert!(matches!(
            compiler.compile(&rule, &node, "h"),
            Err(CompileError::InvalidIdentifier(_))
        ));
    }
}
