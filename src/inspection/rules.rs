//! Rules Engine
//!
//! Static guardrails evaluated per statement, without touching the target.

use crate::connection::PoolManager;
use crate::engine::executor::{run_batch, BatchMode};
use crate::engine::fan_out_sets;
use crate::error::InspectionError;
use crate::inspection::osc::{OscCommand, OscRegistry};
use crate::inspection::rollback::{derive_rollback, RollbackStatement};
use crate::inspection::InspectionBackend;
use crate::review::{DatabaseResults, ErrorLevel, ResultSet, ReviewResult, ReviewSet, SyntaxType};
use crate::sql::{fingerprint, is_read_statement, split_statements, syntax_type, words};
use crate::ticket::ChangeTicket;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

static TYPE_CHANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\balter\s+(?:column\s+)?(?:"[^"]+"|\w+)\s+(?:set\s+data\s+)?type\b"#).unwrap()
});
static SET_NOT_NULL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bset\s+not\s+null\b").unwrap());
static INSERT_WITHOUT_COLUMNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^insert\s+into\s+[^\s(]+\s*(?:values|select|default)\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    DataLoss,
    Performance,
    Compatibility,
    BestPractice,
}

/// A governance rule definition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: &'static str,
    pub name: &'static str,
    pub level: ErrorLevel,
    pub category: RuleCategory,
}

/// A rule violation found in one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule_id: &'static str,
    pub level: ErrorLevel,
    pub message: String,
}

struct Statement<'a> {
    text: &'a str,
    words: Vec<String>,
}

impl Statement<'_> {
    fn word(&self, i: usize) -> &str {
        self.words.get(i).map(String::as_str).unwrap_or("")
    }

    fn has_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }
}

/// The rule set every statement is checked against
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: Self::default_rules(),
        }
    }

    fn rule(&self, id: &'static str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    fn violation(&self, id: &'static str, message: String) -> Option<RuleViolation> {
        self.rule(id).map(|rule| RuleViolation {
            rule_id: rule.id,
            level: rule.level,
            message,
        })
    }

    /// Evaluate one statement against all rules
    pub fn evaluate(&self, text: &str) -> Vec<RuleViolation> {
        let statement = Statement {
            text,
            words: words(text),
        };

        [
            self.check_unbounded_write(&statement),
            self.check_destructive_ddl(&statement),
            self.check_type_change(&statement),
            self.check_set_not_null(&statement),
            self.check_blocking_index(&statement),
            self.check_insert_columns(&statement),
            self.check_unknown_kind(&statement),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Review a whole batch: one row per statement
    pub fn review(&self, sql: &str) -> ReviewSet {
        let mut set = ReviewSet::new(sql);

        let statements = match split_statements(sql) {
            Ok(statements) => statements,
            Err(e) => {
                set.push(
                    ReviewResult::new(1, ErrorLevel::Critical, "CHECKED", "Audit completed", sql)
                        .with_message(e.to_string()),
                );
                return set;
            }
        };
        if statements.is_empty() {
            set.push(
                ReviewResult::new(1, ErrorLevel::Critical, "CHECKED", "Audit completed", sql)
                    .with_message("No valid SQL statement"),
            );
            return set;
        }

        for (i, statement) in statements.iter().enumerate() {
            let violations = self.evaluate(statement);
            let level = violations.iter().map(|v| v.level).max().unwrap_or_default();
            let mut row = ReviewResult::new(i + 1, level, "CHECKED", "Audit completed", statement.as_str());
            if !violations.is_empty() {
                row = row.with_message(
                    violations
                        .iter()
                        .map(|v| format!("[{}] {}", v.rule_id, v.message))
                        .collect::<Vec<_>>()
                        .join("; "),
                );
            }
            if syntax_type(statement) == SyntaxType::Ddl {
                row.sqlsha1 = Some(fingerprint(statement));
            }
            set.push(row);
        }
        set
    }

    /// Rule: UPDATE/DELETE must be bounded by WHERE
    fn check_unbounded_write(&self, s: &Statement) -> Option<RuleViolation> {
        let verb = s.word(0);
        if (verb == "update" || verb == "delete") && !s.has_word("where") {
            return self.violation(
                "R001",
                format!("{} without WHERE affects every row", verb.to_uppercase()),
            );
        }
        None
    }

    /// Rule: DROP TABLE/DATABASE/SCHEMA and TRUNCATE lose data
    fn check_destructive_ddl(&self, s: &Statement) -> Option<RuleViolation> {
        match (s.word(0), s.word(1)) {
            ("drop", kind @ ("table" | "database" | "schema")) => self.violation(
                "R002",
                format!("DROP {} permanently removes data", kind.to_uppercase()),
            ),
            ("truncate", _) => self.violation("R002", "TRUNCATE permanently removes data".to_string()),
            _ => None,
        }
    }

    /// Rule: column type changes rewrite the table
    fn check_type_change(&self, s: &Statement) -> Option<RuleViolation> {
        if s.word(0) == "alter" && s.word(1) == "table" && TYPE_CHANGE.is_match(s.text) {
            return self.violation(
                "R003",
                "Changing a column type rewrites the table and may break readers".to_string(),
            );
        }
        None
    }

    /// Rule: SET NOT NULL scans the table and fails on existing NULLs
    fn check_set_not_null(&self, s: &Statement) -> Option<RuleViolation> {
        if s.word(0) == "alter" && SET_NOT_NULL.is_match(s.text) {
            return self.violation(
                "R004",
                "SET NOT NULL scans the whole table and fails if NULLs exist".to_string(),
            );
        }
        None
    }

    /// Rule: CREATE INDEX should be CONCURRENTLY
    fn check_blocking_index(&self, s: &Statement) -> Option<RuleViolation> {
        let is_index = s.word(0) == "create"
            && (s.word(1) == "index" || (s.word(1) == "unique" && s.word(2) == "index"));
        if is_index && !s.has_word("concurrently") {
            return self.violation(
                "R005",
                "CREATE INDEX without CONCURRENTLY blocks writes to the table".to_string(),
            );
        }
        None
    }

    /// Rule: INSERT should name its columns
    fn check_insert_columns(&self, s: &Statement) -> Option<RuleViolation> {
        if s.word(0) == "insert" && INSERT_WITHOUT_COLUMNS.is_match(s.text) {
            return self.violation(
                "R006",
                "INSERT without a column list breaks when columns change".to_string(),
            );
        }
        None
    }

    /// Rule: statement kinds the reviewer does not recognise
    fn check_unknown_kind(&self, s: &Statement) -> Option<RuleViolation> {
        if syntax_type(s.text) == SyntaxType::Unknown && !is_read_statement(s.text) {
            return self.violation(
                "R007",
                format!("Statement type {} is not recognised", s.word(0).to_uppercase()),
            );
        }
        None
    }

    fn default_rules() -> Vec<Rule> {
        vec![
            Rule {
                id: "R001",
                name: "Unbounded UPDATE/DELETE",
                level: ErrorLevel::Critical,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "R002",
                name: "Destructive DDL",
                level: ErrorLevel::Warning,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "R003",
                name: "Column Type Change",
                level: ErrorLevel::Warning,
                category: RuleCategory::Compatibility,
            },
            Rule {
                id: "R004",
                name: "SET NOT NULL",
                level: ErrorLevel::Warning,
                category: RuleCategory::Performance,
            },
            Rule {
                id: "R005",
                name: "Blocking Index Build",
                level: ErrorLevel::Warning,
                category: RuleCategory::Performance,
            },
            Rule {
                id: "R006",
                name: "INSERT Without Column List",
                level: ErrorLevel::Warning,
                category: RuleCategory::BestPractice,
            },
            Rule {
                id: "R007",
                name: "Unrecognised Statement",
                level: ErrorLevel::Warning,
                category: RuleCategory::BestPractice,
            },
        ]
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Inspection backend that reviews with the local rule set and executes
/// statement by statement in autocommit
pub struct RuleInspector {
    rules: RuleSet,
    pools: Arc<PoolManager>,
    osc: Arc<OscRegistry>,
}

impl RuleInspector {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            rules: RuleSet::new(),
            pools,
            osc: Arc::new(OscRegistry::new()),
        }
    }
}

#[async_trait]
impl InspectionBackend for RuleInspector {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn check(&self, _database: &str, sql: &str) -> Result<ReviewSet, InspectionError> {
        Ok(self.rules.review(sql))
    }

    async fn execute(&self, ticket: &ChangeTicket) -> DatabaseResults {
        let sql = ticket.sql.clone();
        let pools = self.pools.clone();
        let osc = self.osc.clone();
        fan_out_sets(&ticket.db_names, &ticket.sql, move |db| {
            let sql = sql.clone();
            let pools = pools.clone();
            let osc = osc.clone();
            async move { run_batch(&pools, Some(&osc), &db, &sql, BatchMode::Autocommit).await }
        })
        .await
    }

    async fn get_rollback(&self, ticket: &ChangeTicket) -> Result<Vec<RollbackStatement>, InspectionError> {
        Ok(derive_rollback(&ticket.sql))
    }

    async fn osc_control(&self, sqlsha1: &str, command: OscCommand) -> Result<ResultSet, InspectionError> {
        self.osc.control(&self.pools, sqlsha1, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule_ids(sql: &str) -> Vec<&'static str> {
        RuleSet::new().evaluate(sql).iter().map(|v| v.rule_id).collect()
    }

    #[test]
    fn test_unbounded_write() {
        assert_eq!(rule_ids("DELETE FROM t"), vec!["R001"]);
        assert_eq!(rule_ids("update t set a = 1"), vec!["R001"]);
        assert!(rule_ids("update t set a = 1 where id = 2").is_empty());
        // a string containing "where" is not a WHERE clause
        assert_eq!(rule_ids("update t set note = 'where'"), vec!["R001"]);
    }

    #[test]
    fn test_destructive_ddl() {
        assert_eq!(rule_ids("drop table t"), vec!["R002"]);
        assert_eq!(rule_ids("TRUNCATE t"), vec!["R002"]);
        assert!(rule_ids("drop index i").is_empty());
    }

    #[test]
    fn test_alter_rules() {
        assert_eq!(rule_ids("alter table t alter column c type bigint"), vec!["R003"]);
        assert_eq!(rule_ids("alter table t alter c set data type text"), vec!["R003"]);
        assert_eq!(rule_ids("alter table t alter column c set not null"), vec!["R004"]);
        assert!(rule_ids("ALTER TABLE t ADD COLUMN c INT").is_empty());
    }

    #[test]
    fn test_index_and_insert_rules() {
        assert_eq!(rule_ids("create index i on t (c)"), vec!["R005"]);
        assert!(rule_ids("create unique index concurrently i on t (c)").is_empty());
        assert_eq!(rule_ids("insert into t values (1)"), vec!["R006"]);
        assert!(rule_ids("insert into t (a) values (1)").is_empty());
    }

    #[test]
    fn test_unknown_statement_kind() {
        assert_eq!(rule_ids("grant select on t to bob"), vec!["R007"]);
        assert!(rule_ids("select 1").is_empty());
    }

    #[test]
    fn test_review_builds_one_row_per_statement() {
        let set = RuleSet::new().review("alter table t add column c int; delete from t; drop table u;");
        assert_eq!(set.rows.len(), 3);
        assert_eq!(set.rows[0].errlevel, ErrorLevel::Ok);
        assert!(set.rows[0].sqlsha1.is_some());
        assert_eq!(set.rows[1].errlevel, ErrorLevel::Critical);
        assert!(set.rows[1].errormessage.contains("R001"));
        assert_eq!(set.rows[2].errlevel, ErrorLevel::Warning);
        assert_eq!(set.warning_count, 1);
        assert_eq!(set.error_count, 1);
    }

    #[test]
    fn test_review_rows_carry_statement_text_verbatim() {
        let set = RuleSet::new().review("update t set name = 'O''Brien' where id = 1;");
        assert_eq!(set.rows.len(), 1);
        assert_eq!(set.rows[0].sql, "update t set name = 'O''Brien' where id = 1");
        assert_eq!(set.rows[0].errlevel, ErrorLevel::Ok);
    }

    #[test]
    fn test_review_of_empty_or_broken_sql() {
        let empty = RuleSet::new().review("-- nothing here");
        assert_eq!(empty.error_count, 1);

        let broken = RuleSet::new().review("select 'unterminated");
        assert_eq!(broken.error_count, 1);
    }
}
