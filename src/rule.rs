//! Rule records as exported by the data dictionary.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        RuleId(value.to_string())
    }
}

/// Where a rule is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// During data entry only.
    Realtime,
    /// During QC sweeps only.
    Batch,
    Both,
}

impl RuleScope {
    pub fn includes_realtime(self) -> bool {
        matches!(self, RuleScope::Realtime | RuleScope::Both)
    }

    pub fn includes_batch(self) -> bool {
        matches!(self, RuleScope::Batch | RuleScope::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

fn default_active() -> bool {
    true
}

/// A validation rule bound to one field of one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub form_id: String,
    pub field_name: String,
    pub rule_text: String,
    pub scope: RuleScope,
    pub severity: Severity,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Rule {
    /// An active, error-severity rule enforced in both targets.
    pub fn new(
        id: impl Into<String>,
        form_id: impl Into<String>,
        field_name: impl Into<String>,
        rule_text: impl Into<String>,
    ) -> Self {
        Self {
            id: RuleId(id.into()),
            form_id: form_id.into(),
            field_name: field_name.into(),
            rule_text: rule_text.into(),
            scope: RuleScope::Both,
            severity: Severity::Error,
            active: true,
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.rule_text)
    }
}

/// SHA-256 of the rule text, hex encoded.
pub fn content_hash(rule_text: &str) -> String {
    hex::encode(Sha256::digest(rule_text.as_bytes()))
}

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("cannot read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse rule file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Load a JSON array of rules exported from the data dictionary.
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<Rule>, RuleLoadError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| RuleLoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}
