//! Runtime values seen by real-time validation.
//!
//! The form layer hands over whatever it captured, frequently as text, so
//! comparisons coerce towards the more specific side: a number against text
//! parses the text as a number, a date against text parses ISO `YYYY-MM-DD`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Mapping of field name to current value for the record being edited.
///
/// Visit-qualified references (`previous.weight`, `first.visit_date`) are
/// looked up under their dotted key.
pub type RecordContext = HashMap<String, FieldValue>;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

/// Static value kinds, used by the function registry and SQL generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Text,
    Date,
    /// Not known until runtime (plain field references).
    Any,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Number => write!(f, "number"),
            ValueKind::Text => write!(f, "text"),
            ValueKind::Date => write!(f, "date"),
            ValueKind::Any => write!(f, "any"),
        }
    }
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Null or whitespace-only text. This is what `required` rejects.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) | FieldValue::Date(_) => false,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Null => ValueKind::Any,
            FieldValue::Number(_) => ValueKind::Number,
            FieldValue::Date(_) => ValueKind::Date,
            FieldValue::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Null | FieldValue::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            FieldValue::Text(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok(),
            FieldValue::Null | FieldValue::Number(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Orders two values after coercion. `None` when either side is null or
    /// the pair cannot be brought to a common kind.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Null, _) | (_, FieldValue::Null) => None,
            (FieldValue::Number(_), _) | (_, FieldValue::Number(_)) => {
                self.as_number()?.partial_cmp(&other.as_number()?)
            }
            (FieldValue::Date(_), _) | (_, FieldValue::Date(_)) => {
                Some(self.as_date()?.cmp(&other.as_date()?))
            }
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
        }
    }

    /// Equality after coercion. Values of incompatible kinds are unequal;
    /// only nulls make the answer unknown.
    pub fn loosely_equals(&self, other: &FieldValue) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.compare(other) == Some(Ordering::Equal))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_text_coerces_against_number() {
        let text = FieldValue::from("30");
        assert_eq!(text.compare(&FieldValue::from(4_i64)), Some(Ordering::Greater));
        assert_eq!(FieldValue::from(4_i64).compare(&text), Some(Ordering::Less));
    }

    #[test]
    fn test_text_coerces_against_date() {
        let text = FieldValue::from("2024-03-01");
        assert_eq!(
            text.compare(&FieldValue::from(date("2024-01-01"))),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_incomparable_values() {
        assert_eq!(FieldValue::from("abc").compare(&FieldValue::from(1_i64)), None);
        assert_eq!(FieldValue::Null.compare(&FieldValue::from(1_i64)), None);
        assert_eq!(
            FieldValue::from("abc").loosely_equals(&FieldValue::from(1_i64)),
            Some(false)
        );
        assert_eq!(FieldValue::Null.loosely_equals(&FieldValue::from("a")), None);
    }

    #[test]
    fn test_blank_values() {
        assert!(FieldValue::Null.is_blank());
        assert!(FieldValue::from("   ").is_blank());
        assert!(!FieldValue::from(0_i64).is_blank());
    }

    #[test]
    fn test_untagged_json_context() {
        let record: RecordContext = serde_json::from_str(
            r#"{"age": 42, "visit_date": "2025-02-01", "status": "Withdrawn", "notes": null}"#,
        )
        .unwrap();
        assert_eq!(record["age"], FieldValue::Number(42.0));
        assert_eq!(record["visit_date"], FieldValue::Date(date("2025-02-01")));
        assert_eq!(record["status"], FieldValue::Text("Withdrawn".to_string()));
        assert_eq!(record["notes"], FieldValue::Null);
    }

    #[test]
    fn test_display_integers_without_fraction() {
        assert_eq!(FieldValue::Number(65.0).to_string(), "65");
        assert_eq!(FieldValue::Number(72.5).to_string(), "72.5");
    }
}
