//! Persistence seam for the QC engine and its SQLite implementation.

use super::violation::{ViolatingRow, Violation, ViolationChanges, ViolationStatus};
use crate::rule::RuleId;
use crate::sql_compiler::{CompiledQuery, SqlDialect};
use crate::value::DATE_FORMAT;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use sea_query::{Value, Values};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("query was generated for {0:?} and cannot run on this store")]
    Dialect(SqlDialect),
    #[error("violation {0} not found")]
    NotFound(Uuid),
    #[error("query exceeded {0:?} and was interrupted")]
    Timeout(Duration),
}

/// Storage the QC engine runs against.
///
/// Queries are read-only against clinical tables. `apply_changes` must write
/// all of one rule's changes or none of them.
pub trait QcStore {
    fn count_rows(&mut self, query: &CompiledQuery) -> Result<u64, StoreError>;

    fn fetch_violating_rows(&mut self, query: &CompiledQuery)
        -> Result<Vec<ViolatingRow>, StoreError>;

    fn load_violations(&mut self, rule_id: &RuleId) -> Result<Vec<Violation>, StoreError>;

    fn apply_changes(&mut self, changes: &ViolationChanges) -> Result<(), StoreError>;

    fn load_violation(&mut self, violation_id: Uuid) -> Result<Violation, StoreError>;

    fn update_violation(&mut self, violation: &Violation) -> Result<(), StoreError>;
}

const VIOLATION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS qc_violations (
    violation_id         TEXT PRIMARY KEY,
    rule_id              TEXT NOT NULL,
    record_id            TEXT NOT NULL,
    subject_id           TEXT NOT NULL,
    visit_number         TEXT NOT NULL,
    field_name           TEXT NOT NULL,
    expected_description TEXT NOT NULL,
    actual_value         TEXT,
    first_detected_at    TEXT NOT NULL,
    last_confirmed_at    TEXT NOT NULL,
    status               TEXT NOT NULL,
    status_changed_at    TEXT NOT NULL,
    reviewer_note        TEXT,
    UNIQUE (rule_id, record_id)
);
CREATE INDEX IF NOT EXISTS qc_violations_status ON qc_violations (status);
";

const SELECT_VIOLATION: &str = "
SELECT violation_id, rule_id, record_id, subject_id, visit_number, field_name,
       expected_description, actual_value, first_detected_at, last_confirmed_at,
       status, status_changed_at, reviewer_note
FROM qc_violations";

const INSERT_VIOLATION: &str = "
INSERT INTO qc_violations (
    violation_id, rule_id, record_id, subject_id, visit_number, field_name,
    expected_description, actual_value, first_detected_at, last_confirmed_at,
    status, status_changed_at, reviewer_note
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const UPDATE_VIOLATION: &str = "
UPDATE qc_violations
SET expected_description = ?2, actual_value = ?3, last_confirmed_at = ?4,
    status = ?5, status_changed_at = ?6, reviewer_note = ?7
WHERE violation_id = ?1";

impl ToSql for ViolationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ViolationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Virtual machine steps between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

/// [`QcStore`] over a SQLite connection. Clinical tables and the
/// `qc_violations` table live in the same database.
pub struct SqliteStore {
    conn: Connection,
    query_timeout: Option<Duration>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection and make sure `qc_violations` exists.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(VIOLATION_SCHEMA)?;
        Ok(Self {
            conn,
            query_timeout: None,
        })
    }

    /// How long a statement waits on a locked database before failing.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, StoreError> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    /// Upper bound on the run time of one rule query. Slower queries are
    /// interrupted and fail with [`StoreError::Timeout`].
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run a read against the clinical tables with the query deadline armed.
    fn with_deadline<T>(
        &self,
        read: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let Some(timeout) = self.query_timeout else {
            return Ok(read(&self.conn)?);
        };
        let started = Instant::now();
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || started.elapsed() > timeout));
        let result = read(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        result.map_err(|error| match error.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => StoreError::Timeout(timeout),
            _ => StoreError::Sqlite(error),
        })
    }

    fn check_dialect(query: &CompiledQuery) -> Result<(), StoreError> {
        match query.dialect {
            SqlDialect::Sqlite => Ok(()),
            other => Err(StoreError::Dialect(other)),
        }
    }
}

/// Convert sea-query bind values into SQLite values.
fn sqlite_values(values: &Values) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    values
        .0
        .iter()
        .map(|value| match value {
            Value::Bool(Some(b)) => Sql::Integer(i64::from(*b)),
            Value::TinyInt(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::SmallInt(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::Int(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::BigInt(Some(n)) => Sql::Integer(*n),
            Value::TinyUnsigned(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::SmallUnsigned(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::Unsigned(Some(n)) => Sql::Integer(i64::from(*n)),
            Value::Float(Some(n)) => Sql::Real(f64::from(*n)),
            Value::Double(Some(n)) => Sql::Real(*n),
            Value::String(Some(s)) => Sql::Text(s.to_string()),
            Value::ChronoDate(Some(d)) => Sql::Text(d.format(DATE_FORMAT).to_string()),
            _ => Sql::Null,
        })
        .collect()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn violation_from_row(row: &Row<'_>) -> rusqlite::Result<Violation> {
    let id: String = row.get(0)?;
    let violation_id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(Violation {
        violation_id,
        rule_id: RuleId(row.get(1)?),
        record_id: row.get(2)?,
        subject_id: row.get(3)?,
        visit_number: row.get(4)?,
        field_name: row.get(5)?,
        expected_description: row.get(6)?,
        actual_value: row.get(7)?,
        first_detected_at: timestamp(row, 8)?,
        last_confirmed_at: timestamp(row, 9)?,
        status: row.get(10)?,
        status_changed_at: timestamp(row, 11)?,
        reviewer_note: row.get(12)?,
    })
}

fn update(conn: &Connection, violation: &Violation) -> rusqlite::Result<usize> {
    conn.execute(
        UPDATE_VIOLATION,
        params![
            violation.violation_id.to_string(),
            violation.expected_description,
            violation.actual_value,
            violation.last_confirmed_at.to_rfc3339(),
            violation.status,
            violation.status_changed_at.to_rfc3339(),
            violation.reviewer_note,
        ],
    )
}

impl QcStore for SqliteStore {
    fn count_rows(&mut self, query: &CompiledQuery) -> Result<u64, StoreError> {
        Self::check_dialect(query)?;
        let values = sqlite_values(&query.count_parameters);
        let count: i64 = self.with_deadline(|conn| {
            conn.query_row(&query.count_sql, params_from_iter(values.iter()), |row| row.get(0))
        })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn fetch_violating_rows(
        &mut self,
        query: &CompiledQuery,
    ) -> Result<Vec<ViolatingRow>, StoreError> {
        Self::check_dialect(query)?;
        let values = sqlite_values(&query.bind_parameters);
        self.with_deadline(|conn| {
            let mut stmt = conn.prepare(&query.sql_template)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok(ViolatingRow {
                    subject_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    visit_number: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    actual_value: row.get(2)?,
                })
            })?;
            let found = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(found)
        })
    }

    fn load_violations(&mut self, rule_id: &RuleId) -> Result<Vec<Violation>, StoreError> {
        let sql = format!("{} WHERE rule_id = ?1 ORDER BY record_id", SELECT_VIOLATION);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![rule_id.0], violation_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn apply_changes(&mut self, changes: &ViolationChanges) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for violation in &changes.inserted {
            tx.execute(
                INSERT_VIOLATION,
                params![
                    violation.violation_id.to_string(),
                    violation.rule_id.0,
                    violation.record_id,
                    violation.subject_id,
                    violation.visit_number,
                    violation.field_name,
                    violation.expected_description,
                    violation.actual_value,
                    violation.first_detected_at.to_rfc3339(),
                    violation.last_confirmed_at.to_rfc3339(),
                    violation.status,
                    violation.status_changed_at.to_rfc3339(),
                    violation.reviewer_note,
                ],
            )?;
        }
        for violation in &changes.updated {
            update(&tx, violation)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_violation(&mut self, violation_id: Uuid) -> Result<Violation, StoreError> {
        let sql = format!("{} WHERE violation_id = ?1", SELECT_VIOLATION);
        self.conn
            .query_row(&sql, params![violation_id.to_string()], violation_from_row)
            .optional()?
            .ok_or(StoreError::NotFound(violation_id))
    }

    fn update_violation(&mut self, violation: &Violation) -> Result<(), StoreError> {
        match update(&self.conn, violation)? {
            0 => Err(StoreError::NotFound(violation.violation_id)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rule;
    use crate::qc::violation::reconcile;
    use crate::qc::ReopenPolicy;
    use crate::rule::Rule;
    use crate::sql_compiler::SqlCompiler;

    fn store_with_data() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE cog (subject_id TEXT, visit_number INTEGER, mmse_total INTEGER);
                 INSERT INTO cog VALUES ('S1', 1, 25), ('S1', 2, 35), ('S2', 1, -1), ('S3', 1, NULL);",
            )
            .unwrap();
        store
    }

    fn query(dialect: SqlDialect) -> CompiledQuery {
        let rule = Rule::new("COG-01", "COG", "mmse_total", "mmse_total between 0 and 30");
        let node = parse_rule(&rule.rule_text).unwrap();
        SqlCompiler::new(dialect)
            .compile(&rule, &node, &rule.content_hash())
            .unwrap()
    }

    #[test]
    fn test_fetch_and_count() {
        let mut store = store_with_data();
        let q = query(SqlDialect::Sqlite);
        assert_eq!(store.count_rows(&q).unwrap(), 4);
        let rows = store.fetch_violating_rows(&q).unwrap();
        assert_eq!(
            rows,
            vec![
                ViolatingRow {
                    subject_id: "S1".into(),
                    visit_number: "2".into(),
                    actual_value: Some("35".into()),
                },
                ViolatingRow {
                    subject_id: "S2".into(),
                    visit_number: "1".into(),
                    actual_value: Some("-1".into()),
                },
            ]
        );
    }

    fn sqlite_query(form: &str, field: &str, text: &str) -> CompiledQuery {
        let rule = Rule::new("R1", form, field, text);
        let node = parse_rule(text).unwrap();
        SqlCompiler::new(SqlDialect::Sqlite)
            .compile(&rule, &node, &rule.content_hash())
            .unwrap()
    }

    fn flagged(store: &mut SqliteStore, q: &CompiledQuery) -> Vec<Option<String>> {
        store
            .fetch_violating_rows(q)
            .unwrap()
            .into_iter()
            .map(|row| row.actual_value)
            .collect()
    }

    #[test]
    fn test_text_column_compares_numerically() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE cogtext (subject_id TEXT, visit_number INTEGER, mmse_total TEXT);
                 INSERT INTO cogtext VALUES
                     ('S1', 1, '4'), ('S2', 1, '25'), ('S3', 1, ' 30 '),
                     ('S4', 1, '45'), ('S5', 1, 'abc'), ('S6', 1, ''), ('S7', 1, NULL);",
            )
            .unwrap();
        let q = sqlite_query("COGTEXT", "mmse_total", "mmse_total between 0 and 30");
        assert_eq!(
            flagged(&mut store, &q),
            vec![Some("45".to_string()), Some("abc".to_string())]
        );
    }

    #[test]
    fn test_unreadable_date_is_flagged() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE visits (subject_id TEXT, visit_number INTEGER,
                                      visit_date TEXT, baseline_date TEXT);
                 INSERT INTO visits VALUES
                     ('S1', 1, '2025-02-01', '2024-01-01'),
                     ('S2', 1, 'not-a-date', '2024-01-01'),
                     ('S3', 1, '2025-02-01', NULL);",
            )
            .unwrap();
        let q = sqlite_query(
            "VISITS",
            "visit_date",
            "visit_date within 60 days of baseline_date + 365",
        );
        assert_eq!(flagged(&mut store, &q), vec![Some("not-a-date".to_string())]);
    }

    #[test]
    fn test_runaway_query_is_interrupted() {
        let mut store = store_with_data().with_query_timeout(Duration::from_millis(50));
        let mut runaway = query(SqlDialect::Sqlite);
        runaway.sql_template = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
             SELECT x, x, x FROM n WHERE x < 0"
            .to_string();
        runaway.bind_parameters = Values(Vec::new());

        let started = Instant::now();
        assert!(matches!(
            store.fetch_violating_rows(&runaway),
            Err(StoreError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));

        let q = query(SqlDialect::Sqlite);
        assert_eq!(store.fetch_violating_rows(&q).unwrap().len(), 2);
        assert_eq!(store.count_rows(&q).unwrap(), 4);
    }

    #[test]
    fn test_postgres_query_is_rejected() {
        let mut store = store_with_data();
        assert!(matches!(
            store.fetch_violating_rows(&query(SqlDialect::Postgres)),
            Err(StoreError::Dialect(SqlDialect::Postgres))
        ));
    }

    #[test]
    fn test_violations_persist() {
        let mut store = store_with_data();
        let q = query(SqlDialect::Sqlite);
        let rows = store.fetch_violating_rows(&q).unwrap();
        let changes = reconcile(&q, vec![], &rows, Utc::now(), ReopenPolicy::default());
        store.apply_changes(&changes).unwrap();

        let loaded = store.load_violations(&q.rule_id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].record_id, "S1/2/mmse_total");
        assert_eq!(loaded[0].status, ViolationStatus::Open);

        let one = store.load_violation(loaded[1].violation_id).unwrap();
        assert_eq!(one, loaded[1]);
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let mut store = store_with_data();
        let q = query(SqlDialect::Sqlite);
        let rows = store.fetch_violating_rows(&q).unwrap();
        let mut changes = reconcile(&q, vec![], &rows, Utc::now(), ReopenPolicy::default());
        // Same id twice violates the primary key on the second insert.
        let duplicate = changes.inserted[0].clone();
        changes.inserted.push(duplicate);

        assert!(store.apply_changes(&changes).is_err());
        assert!(store.load_violations(&q.rule_id).unwrap().is_empty());
    }

    #[test]
    fn test_missing_violation() {
        let mut store = store_with_data();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.load_violation(id),
            Err(StoreError::NotFound(missing)) if missing == id
        ));
    }
}
