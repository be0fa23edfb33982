//! Native batch execution
//!
//! Runs a batch of statements on one database through a pooled connection.
//! The connection is leased for the duration of the batch and returned to
//! the pool when it is dropped, on success and error alike.

use crate::connection::PoolManager;
use crate::error::{db_error_message, AppError};
use crate::inspection::osc::{OscRegistry, RunningStatement};
use crate::review::{ReviewResult, ReviewSet};
use crate::sql::{fingerprint, split_statements};
use chrono::Utc;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

/// Transaction scope of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Each statement commits on its own
    Autocommit,
    /// One transaction with a savepoint per statement; statements before a
    /// failure are committed, the failing one is rolled back
    CommitPrefix,
    /// One transaction for the whole batch; any failure rolls everything back
    AllOrNothing,
}

/// Execute `sql` on `database`. Driver failures are folded into the result.
pub async fn run_batch(
    pools: &PoolManager,
    osc: Option<&OscRegistry>,
    database: &str,
    sql: &str,
    mode: BatchMode,
) -> ReviewSet {
    match try_run_batch(pools, osc, database, sql, mode).await {
        Ok(set) => set,
        Err(e) => {
            warn!("Batch on {} could not run: {}", database, e);
            ReviewSet::denied(sql, Some(database), "Execute failed", e.to_string())
        }
    }
}

async fn try_run_batch(
    pools: &PoolManager,
    osc: Option<&OscRegistry>,
    database: &str,
    sql: &str,
    mode: BatchMode,
) -> Result<ReviewSet, AppError> {
    let statements = split_statements(sql).map_err(|e| AppError::Validation(e.to_string()))?;
    let pool = pools.get(Some(database)).await?;
    let mut client = pool.get().await?;

    let pid: i32 = match osc {
        Some(_) => client.query_one("SELECT pg_backend_pid()", &[]).await?.get(0),
        None => 0,
    };
    let tracker = Tracker { osc, pid, database };

    let mut rows = Vec::with_capacity(statements.len());
    let mut failure: Option<(usize, String)> = None;

    match mode {
        BatchMode::Autocommit => {
            for (i, statement) in statements.iter().enumerate() {
                if failure.is_some() {
                    rows.push(ReviewResult::not_executed(i + 1, statement));
                    continue;
                }
                let (result, elapsed) = tracker.run(statement, client.execute(statement.as_str(), &[])).await;
                rows.push(outcome_row(i + 1, statement, result, elapsed, &mut failure));
            }
        }
        BatchMode::CommitPrefix => {
            let mut tx = client.transaction().await?;
            for (i, statement) in statements.iter().enumerate() {
                if failure.is_some() {
                    rows.push(ReviewResult::not_executed(i + 1, statement));
                    continue;
                }
                let savepoint = tx.transaction().await?;
                let (result, elapsed) = tracker.run(statement, savepoint.execute(statement.as_str(), &[])).await;
                if result.is_ok() {
                    savepoint.commit().await?;
                } else {
                    savepoint.rollback().await?;
                }
                rows.push(outcome_row(i + 1, statement, result, elapsed, &mut failure));
            }
            tx.commit().await?;
        }
        BatchMode::AllOrNothing => {
            let tx = client.transaction().await?;
            for (i, statement) in statements.iter().enumerate() {
                if failure.is_some() {
                    rows.push(ReviewResult::not_executed(i + 1, statement));
                    continue;
                }
                let (result, elapsed) = tracker.run(statement, tx.execute(statement.as_str(), &[])).await;
                rows.push(outcome_row(i + 1, statement, result, elapsed, &mut failure));
            }
            match &failure {
                None => tx.commit().await?,
                Some((failed_id, _)) => {
                    tx.rollback().await?;
                    for row in rows.iter_mut().filter(|r| r.id < *failed_id) {
                        row.stagestatus = "Rolled back".to_string();
                        row.errormessage = format!("Rolled back because statement {} failed", failed_id);
                        row.affected_rows = 0;
                    }
                }
            }
        }
    }

    let mut set = ReviewSet::new(sql);
    for mut row in rows {
        row.sqlsha1 = Some(fingerprint(&row.sql));
        row.db_name = Some(database.to_string());
        set.push(row);
    }
    set.error = failure.map(|(_, message)| message);
    debug!(
        "Executed batch on {}: {} statements, {} errors",
        database,
        set.rows.len(),
        set.error_count
    );
    Ok(set)
}

fn outcome_row(
    id: usize,
    statement: &str,
    result: Result<u64, tokio_postgres::Error>,
    elapsed: f64,
    failure: &mut Option<(usize, String)>,
) -> ReviewResult {
    match result {
        Ok(affected) => ReviewResult::executed(id, statement, affected, elapsed),
        Err(e) => {
            let message = db_error_message(&e);
            *failure = Some((id, message.clone()));
            ReviewResult::execute_failed(id, statement, message, elapsed)
        }
    }
}

/// Keeps the online-schema-change registry in step with the running statement
struct Tracker<'a> {
    osc: Option<&'a OscRegistry>,
    pid: i32,
    database: &'a str,
}

impl Tracker<'_> {
    async fn run<F>(&self, statement: &str, execution: F) -> (Result<u64, tokio_postgres::Error>, f64)
    where
        F: Future<Output = Result<u64, tokio_postgres::Error>>,
    {
        let sqlsha1 = fingerprint(statement);
        if let Some(osc) = self.osc {
            osc.register(
                &sqlsha1,
                RunningStatement {
                    pid: self.pid,
                    database: self.database.to_string(),
                    statement: statement.to_string(),
                    started_at: Utc::now(),
                },
            )
            .await;
        }

        let started = Instant::now();
        let result = execution.await;
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(osc) = self.osc {
            osc.unregister(&sqlsha1, self.pid).await;
        }
        (result, elapsed)
    }
}
