//! Engine facade
//!
//! `SqlEngine` is what the ticket workflow talks to. It screens read
//! queries, applies the local check policies on top of the inspection
//! backend's verdict and routes execution to the native driver or the
//! backend.

use crate::config::{ConfigError, Settings};
use crate::connection::Instance;
use crate::engine::{fan_out, fan_out_sets, DatabaseEngine};
use crate::error::{AppError, InspectionError};
use crate::inspection::{InspectionBackend, OscCommand, RollbackStatement};
use crate::review::{DatabaseResults, ErrorLevel, ResultSet, ReviewSet, SyntaxType};
use crate::sql::{filter_sql, is_read_statement, query_check, remove_comments, syntax_type};
use crate::ticket::{ChangeTicket, ExecutionMode};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine-independent rules applied to every check
#[derive(Debug, Clone)]
pub struct CheckPolicy {
    critical_pattern: Option<Regex>,
    query_max_rows: u64,
}

impl CheckPolicy {
    pub fn new(critical_pattern: Option<Regex>, query_max_rows: u64) -> Self {
        Self {
            critical_pattern,
            query_max_rows,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.compile_critical_regex()?,
            settings.execution.query_max_rows,
        ))
    }

    fn denial(&self, statement: &str) -> Option<&'static str> {
        if is_read_statement(statement) {
            return Some("Rejected unsupported statement: queries must use the query feature, not a change ticket");
        }
        let lowered = statement.trim().to_lowercase();
        match &self.critical_pattern {
            Some(pattern) if pattern.is_match(&lowered) => {
                Some("Rejected high-risk SQL: statement matches the forbidden pattern")
            }
            _ => None,
        }
    }

    fn row_cap(&self, requested: u64) -> u64 {
        match (requested, self.query_max_rows) {
            (0, max) => max,
            (n, 0) => n,
            (n, max) => n.min(max),
        }
    }
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self::new(None, 1000)
    }
}

#[derive(Clone)]
pub struct SqlEngine {
    driver: Arc<dyn DatabaseEngine>,
    inspector: Arc<dyn InspectionBackend>,
    policy: Arc<CheckPolicy>,
}

impl SqlEngine {
    pub fn new(
        driver: Arc<dyn DatabaseEngine>,
        inspector: Arc<dyn InspectionBackend>,
        policy: Arc<CheckPolicy>,
    ) -> Self {
        Self {
            driver,
            inspector,
            policy,
        }
    }

    pub fn instance(&self) -> &Instance {
        self.driver.instance()
    }

    pub fn inspector_name(&self) -> &'static str {
        self.inspector.name()
    }

    pub fn supports_backup(&self) -> bool {
        self.driver.supports_backup()
    }

    /// Run a read-only query: first statement only, allow-listed verbs, row cap
    /// of `min(limit, configured maximum)` (0 means the configured maximum)
    pub async fn query(&self, database: &str, sql: &str, limit: u64) -> ResultSet {
        let check = query_check(sql);
        if check.bad_query {
            return ResultSet::failed(sql, check.msg);
        }

        let statement = filter_sql(&check.filtered_sql, self.policy.row_cap(limit));
        debug!(database, "Query: {}", statement);
        let mut result = self.driver.query(database, &statement).await;
        if check.has_star && result.warning.is_none() {
            result.warning = Some(check.msg);
        }
        result
    }

    /// Review `sql` for one database.
    ///
    /// The backend verdict is walked statement by statement; a read statement
    /// or a match of the forbidden pattern ends the walk with a critical row.
    pub async fn check(&self, database: &str, sql: &str) -> Result<ReviewSet, InspectionError> {
        let verdict = self.inspector.check(database, sql).await?;
        if let Some(error) = verdict.error {
            return Err(InspectionError::Malformed(error));
        }

        let mut result = ReviewSet::new(sql);
        let mut syntax = SyntaxType::Dml;

        for row in verdict.rows {
            let statement = remove_comments(&row.sql);
            if let Some(reason) = self.policy.denial(&statement) {
                let mut rejected = row;
                rejected.errlevel = ErrorLevel::Critical;
                rejected.errormessage = reason.to_string();
                result.push(rejected);
                result.is_critical = true;
                break;
            }
            if syntax_type(&statement) == SyntaxType::Ddl {
                syntax = SyntaxType::Ddl;
            }
            result.push(row);
        }

        result.syntax_type = syntax;
        Ok(result)
    }

    /// Check every database concurrently, in list order
    pub async fn check_all(
        &self,
        db_names: &[String],
        sql: &str,
    ) -> Vec<(String, Result<ReviewSet, InspectionError>)> {
        let sql = sql.to_string();
        fan_out(db_names, |db| {
            let engine = self.clone();
            let sql = sql.clone();
            async move { engine.check(&db, &sql).await }
        })
        .await
        .into_iter()
        .map(|(db, joined)| {
            let verdict = joined
                .map_err(|e| InspectionError::Unreachable(format!("check task failed: {}", e)))
                .and_then(|r| r);
            (db, verdict)
        })
        .collect()
    }

    /// Execute a ticket on all of its databases.
    ///
    /// A read-only target denies every database without running anything.
    pub async fn execute_workflow(&self, ticket: &ChangeTicket) -> DatabaseResults {
        let Some(first) = ticket.first_db() else {
            return DatabaseResults::new();
        };

        let denial = match self.driver.is_read_only(first).await {
            Ok(false) => None,
            Ok(true) => Some("Instance is read-only, execution denied".to_string()),
            Err(e) => Some(format!("Could not determine read-only status: {}", e)),
        };
        if let Some(message) = denial {
            warn!(ticket_id = ticket.id, "⛔ {}", message);
            return ticket
                .db_names
                .iter()
                .map(|db| {
                    (
                        db.clone(),
                        ReviewSet::denied(&ticket.sql, Some(db), "Execute failed", message.clone()),
                    )
                })
                .collect();
        }

        match ticket.execution_mode {
            ExecutionMode::Manual => {
                let driver = self.driver.clone();
                let sql = ticket.sql.clone();
                fan_out_sets(&ticket.db_names, &ticket.sql, move |db| {
                    let driver = driver.clone();
                    let sql = sql.clone();
                    async move { driver.execute(&db, &sql).await }
                })
                .await
            }
            ExecutionMode::Automatic | ExecutionMode::External => self.inspector.execute(ticket).await,
        }
    }

    pub async fn get_rollback(&self, ticket: &ChangeTicket) -> Result<Vec<RollbackStatement>, InspectionError> {
        self.inspector.get_rollback(ticket).await
    }

    /// Control an in-flight schema change; failures are reported in the result
    pub async fn osc_control(&self, sqlsha1: &str, command: OscCommand) -> ResultSet {
        match self.inspector.osc_control(sqlsha1, command).await {
            Ok(result) => result,
            Err(e) => ResultSet::failed(sqlsha1, e.to_string()),
        }
    }

    pub async fn seconds_behind_master(&self) -> Result<Option<f64>, AppError> {
        self.driver.seconds_behind_master().await
    }

    pub async fn server_version(&self) -> Result<(u32, u32, u32), AppError> {
        self.driver.server_version().await
    }

    pub async fn get_variables(&self, names: &[String]) -> ResultSet {
        self.driver.get_variables(names).await
    }

    pub async fn set_variable(&self, name: &str, value: &str) -> ResultSet {
        self.driver.set_variable(name, value).await
    }

    pub async fn kill_connection(&self, pid: i32) -> ResultSet {
        self.driver.kill_connection(pid).await
    }

    pub async fn close(&self) {
        self.driver.close().await;
    }
}
