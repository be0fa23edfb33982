//! Online schema change control
//!
//! While a backend executes a batch, each running statement is registered
//! under its fingerprint together with the backend PID running it, so the
//! statement can be inspected or cancelled from another request. A ticket
//! targeting several databases runs the same statement on each of them, so
//! one fingerprint can map to several backends at once.

use crate::connection::PoolManager;
use crate::error::InspectionError;
use crate::review::ResultSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OscCommand {
    Get,
    Kill,
    Pause,
    Resume,
}

impl FromStr for OscCommand {
    type Err = InspectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "kill" => Ok(Self::Kill),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            other => Err(InspectionError::Unsupported(format!("unknown command {}", other))),
        }
    }
}

/// A statement currently running on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningStatement {
    pub pid: i32,
    pub database: String,
    pub statement: String,
    pub started_at: DateTime<Utc>,
}

const PROGRESS_QUERY: &str = "\
    SELECT a.pid::text, a.datname::text, a.state::text, \
           COALESCE(p.phase, '')::text AS phase, \
           COALESCE(p.blocks_done, 0)::text AS blocks_done, \
           COALESCE(p.blocks_total, 0)::text AS blocks_total, \
           EXTRACT(EPOCH FROM now() - a.query_start)::bigint::text AS elapsed_seconds \
    FROM pg_stat_activity a \
    LEFT JOIN pg_stat_progress_create_index p ON p.pid = a.pid \
    WHERE a.pid = $1";

#[derive(Default)]
pub struct OscRegistry {
    running: RwLock<HashMap<String, Vec<RunningStatement>>>,
}

impl OscRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sqlsha1: &str, statement: RunningStatement) {
        self.running
            .write()
            .await
            .entry(sqlsha1.to_string())
            .or_default()
            .push(statement);
    }

    /// Drop the entry of the backend `pid` once its statement is done
    pub async fn unregister(&self, sqlsha1: &str, pid: i32) {
        let mut running = self.running.write().await;
        if let Some(entries) = running.get_mut(sqlsha1) {
            entries.retain(|r| r.pid != pid);
            if entries.is_empty() {
                running.remove(sqlsha1);
            }
        }
    }

    /// Every backend currently running the statement `sqlsha1`
    pub async fn lookup(&self, sqlsha1: &str) -> Vec<RunningStatement> {
        self.running.read().await.get(sqlsha1).cloned().unwrap_or_default()
    }

    /// Run `command` against every backend running the statement `sqlsha1`
    pub async fn control(
        &self,
        pools: &PoolManager,
        sqlsha1: &str,
        command: OscCommand,
    ) -> Result<ResultSet, InspectionError> {
        match command {
            OscCommand::Pause | OscCommand::Resume => {
                return Err(InspectionError::Unsupported(format!(
                    "{:?} is not supported for PostgreSQL schema changes",
                    command
                )))
            }
            OscCommand::Get | OscCommand::Kill => {}
        }

        let running = self.lookup(sqlsha1).await;
        let Some(first) = running.first() else {
            return Ok(ResultSet::failed(
                sqlsha1,
                "No running schema change for this statement",
            ));
        };

        let pool = pools
            .get(None)
            .await
            .map_err(|e| InspectionError::Unreachable(e.to_string()))?;
        let client = pool
            .get()
            .await
            .map_err(|e| InspectionError::Unreachable(e.to_string()))?;

        let mut result = ResultSet::new(&first.statement);
        match command {
            OscCommand::Get => {
                result.column_list = [
                    "pid",
                    "database",
                    "state",
                    "phase",
                    "blocks_done",
                    "blocks_total",
                    "elapsed_seconds",
                ]
                .iter()
                .map(|c| c.to_string())
                .collect();
                for backend in &running {
                    let rows = client
                        .query(PROGRESS_QUERY, &[&backend.pid])
                        .await
                        .map_err(|e| InspectionError::Unreachable(e.to_string()))?;
                    for row in rows {
                        let cells = (0..result.column_list.len())
                            .map(|i| row.get::<_, Option<String>>(i))
                            .collect();
                        result.rows.push(cells);
                    }
                }
            }
            _ => {
                result.column_list = vec!["pid".to_string(), "database".to_string(), "cancelled".to_string()];
                for backend in &running {
                    let row = client
                        .query_one("SELECT pg_cancel_backend($1)", &[&backend.pid])
                        .await
                        .map_err(|e| InspectionError::Unreachable(e.to_string()))?;
                    let cancelled: bool = row.get(0);
                    if cancelled {
                        info!("🛑 Cancelled backend {} on {} running {}", backend.pid, backend.database, sqlsha1);
                    } else {
                        warn!("Backend {} on {} was not cancelled", backend.pid, backend.database);
                    }
                    result.rows.push(vec![
                        Some(backend.pid.to_string()),
                        Some(backend.database.clone()),
                        Some(cancelled.to_string()),
                    ]);
                }
            }
        }
        result.affected_rows = result.rows.len() as u64;
        Ok(result)
    }
}
