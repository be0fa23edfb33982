//! Review and result models
//!
//! Value objects carried between the inspection backends, the engines and the
//! ticket state machine: one `ReviewResult` per statement, batched into a
//! `ReviewSet` per database, and `ResultSet` for read queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Statement severity: 0 ok, 1 warning, 2 critical/error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorLevel {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl From<ErrorLevel> for u8 {
    fn from(level: ErrorLevel) -> Self {
        match level {
            ErrorLevel::Ok => 0,
            ErrorLevel::Warning => 1,
            ErrorLevel::Critical => 2,
        }
    }
}

impl TryFrom<u8> for ErrorLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorLevel::Ok),
            1 => Ok(ErrorLevel::Warning),
            2 => Ok(ErrorLevel::Critical),
            other => Err(format!("unknown error level {}", other)),
        }
    }
}

/// Ticket syntax classification: 0 unknown, 1 DDL, 2 DML
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SyntaxType {
    #[default]
    Unknown,
    Ddl,
    Dml,
}

impl From<SyntaxType> for u8 {
    fn from(syntax: SyntaxType) -> Self {
        match syntax {
            SyntaxType::Unknown => 0,
            SyntaxType::Ddl => 1,
            SyntaxType::Dml => 2,
        }
    }
}

impl TryFrom<u8> for SyntaxType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyntaxType::Unknown),
            1 => Ok(SyntaxType::Ddl),
            2 => Ok(SyntaxType::Dml),
            other => Err(format!("unknown syntax type {}", other)),
        }
    }
}

impl fmt::Display for SyntaxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxType::Unknown => write!(f, "unknown"),
            SyntaxType::Ddl => write!(f, "DDL"),
            SyntaxType::Dml => write!(f, "DML"),
        }
    }
}

/// Verdict or outcome for a single statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub id: usize,
    pub errlevel: ErrorLevel,
    pub stage: String,
    pub stagestatus: String,
    pub errormessage: String,
    pub sql: String,
    #[serde(default)]
    pub affected_rows: u64,
    /// Execution time in seconds
    #[serde(default)]
    pub execute_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlsha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
}

impl ReviewResult {
    pub fn new(id: usize, errlevel: ErrorLevel, stage: &str, stagestatus: &str, sql: impl Into<String>) -> Self {
        Self {
            id,
            errlevel,
            stage: stage.to_string(),
            stagestatus: stagestatus.to_string(),
            errormessage: "None".to_string(),
            sql: sql.into(),
            affected_rows: 0,
            execute_time: 0.0,
            sqlsha1: None,
            db_name: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.errormessage = message.into();
        self
    }

    pub fn with_db(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    /// A statement that ran
    pub fn executed(id: usize, sql: &str, affected_rows: u64, execute_time: f64) -> Self {
        let mut row = Self::new(id, ErrorLevel::Ok, "Execute Successfully", "Execute Successfully", sql);
        row.affected_rows = affected_rows;
        row.execute_time = execute_time;
        row
    }

    /// A statement the database refused
    pub fn execute_failed(id: usize, sql: &str, message: impl Into<String>, execute_time: f64) -> Self {
        let mut row = Self::new(id, ErrorLevel::Critical, "Execute failed", "Execute Failed", sql)
            .with_message(message);
        row.execute_time = execute_time;
        row
    }

    /// A statement skipped because an earlier one failed
    pub fn not_executed(id: usize, sql: &str) -> Self {
        Self::new(id, ErrorLevel::Ok, "Skipped", "Not executed", sql)
            .with_message("Not executed because an earlier statement failed")
    }

    /// True when the row carries a real message rather than the "None" placeholder
    pub fn has_message(&self) -> bool {
        !self.errormessage.is_empty() && self.errormessage != "None"
    }
}

/// A batch of statement-level verdicts for one database
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReviewSet {
    pub full_sql: String,
    pub rows: Vec<ReviewResult>,
    pub warning_count: usize,
    pub error_count: usize,
    pub is_critical: bool,
    pub syntax_type: SyntaxType,
    /// Set when the whole batch failed outright
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReviewSet {
    pub fn new(full_sql: impl Into<String>) -> Self {
        Self {
            full_sql: full_sql.into(),
            ..Default::default()
        }
    }

    /// Append a row and keep the aggregate counters in step
    pub fn push(&mut self, row: ReviewResult) {
        match row.errlevel {
            ErrorLevel::Warning => self.warning_count += 1,
            ErrorLevel::Critical => self.error_count += 1,
            ErrorLevel::Ok => {}
        }
        self.rows.push(row);
    }

    /// Rebuild the counters after rows were edited in place
    pub fn recount(&mut self) {
        self.warning_count = self.rows.iter().filter(|r| r.errlevel == ErrorLevel::Warning).count();
        self.error_count = self.rows.iter().filter(|r| r.errlevel == ErrorLevel::Critical).count();
    }

    /// Highest level across all rows; a top-level error counts as critical
    pub fn max_level(&self) -> ErrorLevel {
        let row_max = self.rows.iter().map(|r| r.errlevel).max().unwrap_or_default();
        if self.error.is_some() {
            ErrorLevel::Critical
        } else {
            row_max
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.warning_count == 0 && self.error_count == 0
    }

    /// A single-row denial for a batch that could not run at all
    pub fn denied(full_sql: &str, db_name: Option<&str>, stage: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut set = ReviewSet::new(full_sql);
        let mut row = ReviewResult::new(1, ErrorLevel::Critical, stage, "Execute Failed", full_sql)
            .with_message(message.clone());
        row.db_name = db_name.map(str::to_string);
        set.push(row);
        set.error = Some(message);
        set
    }
}

/// Result of a read-only query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub full_sql: String,
    pub column_list: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected_rows: u64,
    /// Query time in seconds
    pub query_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultSet {
    pub fn new(full_sql: impl Into<String>) -> Self {
        Self {
            full_sql: full_sql.into(),
            ..Default::default()
        }
    }

    pub fn failed(full_sql: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            full_sql: full_sql.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Per-database outcome map produced by a check or execution fan-out
pub type DatabaseResults = BTreeMap<String, ReviewSet>;

/// Sum of warning and error counters across a fan-out
pub fn total_counts(results: &DatabaseResults) -> (usize, usize) {
    results.values().fold((0, 0), |(w, e), set| {
        (w + set.warning_count, e + set.error_count)
    })
}
