//! PostgreSQL engine

use crate::connection::{Instance, PoolManager};
use crate::engine::executor::{run_batch, BatchMode};
use crate::engine::DatabaseEngine;
use crate::error::{db_error_message, AppError};
use crate::review::{ResultSet, ReviewSet};
use async_trait::async_trait;
use deadpool_postgres::Object;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::SimpleQueryMessage;
use tracing::{info, warn};

static SETTING_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_.]*$").unwrap());

/// Split `server_version_num` into (major, minor, patch)
pub fn parse_version_num(num: u32) -> (u32, u32, u32) {
    if num >= 100_000 {
        // 10 and later: MMmmmm
        (num / 10_000, num % 10_000, 0)
    } else {
        (num / 10_000, (num / 100) % 100, num % 100)
    }
}

pub struct PostgresEngine {
    pools: Arc<PoolManager>,
}

impl PostgresEngine {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    async fn client(&self, database: Option<&str>) -> Result<Object, AppError> {
        let pool = self.pools.get(database).await?;
        Ok(pool.get().await?)
    }

    async fn try_query(&self, database: &str, sql: &str) -> Result<ResultSet, AppError> {
        let mut client = self.client(Some(database)).await?;
        let started = Instant::now();

        let tx = client.transaction().await?;
        tx.batch_execute("SET TRANSACTION READ ONLY").await?;
        let messages = tx.simple_query(sql).await?;
        tx.rollback().await?;

        let mut result = ResultSet::new(sql);
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if result.column_list.is_empty() {
                    result.column_list = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result
                    .rows
                    .push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
        }
        result.affected_rows = result.rows.len() as u64;
        result.query_time = started.elapsed().as_secs_f64();
        Ok(result)
    }

    async fn try_get_variables(&self, names: &[String]) -> Result<ResultSet, AppError> {
        let client = self.client(None).await?;
        let rows = if names.is_empty() {
            client
                .query("SELECT name, setting FROM pg_settings ORDER BY name", &[])
                .await?
        } else {
            client
                .query(
                    "SELECT name, setting FROM pg_settings WHERE name = ANY($1) ORDER BY name",
                    &[&names],
                )
                .await?
        };

        let mut result = ResultSet::new("pg_settings");
        result.column_list = vec!["name".to_string(), "setting".to_string()];
        for row in rows {
            result.rows.push(vec![row.get(0), row.get(1)]);
        }
        result.affected_rows = result.rows.len() as u64;
        Ok(result)
    }

    async fn try_set_variable(&self, name: &str, value: &str) -> Result<ResultSet, AppError> {
        let name = name.trim().to_lowercase();
        if !SETTING_NAME.is_match(&name) {
            return Err(AppError::Validation(format!("Invalid setting name: {}", name)));
        }
        let statement = format!("ALTER SYSTEM SET {} = '{}'", name, value.replace('\'', "''"));

        let client = self.client(None).await?;
        client.batch_execute(&statement).await?;
        client.query_one("SELECT pg_reload_conf()", &[]).await?;
        info!("⚙️  {} on {}", statement, self.pools.instance().name);

        let mut result = ResultSet::new(statement);
        result.affected_rows = 1;
        Ok(result)
    }

    async fn try_kill(&self, pid: i32) -> Result<ResultSet, AppError> {
        let client = self.client(None).await?;
        let row = client
            .query_one("SELECT pg_terminate_backend($1)", &[&pid])
            .await?;
        let terminated: bool = row.get(0);
        if !terminated {
            warn!("Backend {} was not terminated", pid);
        }

        let mut result = ResultSet::new(format!("SELECT pg_terminate_backend({})", pid));
        result.column_list = vec!["terminated".to_string()];
        result.rows.push(vec![Some(terminated.to_string())]);
        result.affected_rows = 1;
        Ok(result)
    }
}

fn failed(full_sql: &str, err: AppError) -> ResultSet {
    let message = match &err {
        AppError::Database(e) => db_error_message(e),
        other => other.to_string(),
    };
    ResultSet::failed(full_sql, message)
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn instance(&self) -> &Instance {
        self.pools.instance()
    }

    async fn query(&self, database: &str, sql: &str) -> ResultSet {
        match self.try_query(database, sql).await {
            Ok(result) => result,
            Err(e) => failed(sql, e),
        }
    }

    async fn execute(&self, database: &str, sql: &str) -> ReviewSet {
        run_batch(&self.pools, None, database, sql, BatchMode::CommitPrefix).await
    }

    async fn is_read_only(&self, database: &str) -> Result<bool, AppError> {
        let client = self.client(Some(database)).await?;
        let row = client
            .query_one(
                "SELECT pg_is_in_recovery() OR current_setting('default_transaction_read_only') = 'on'",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn seconds_behind_master(&self) -> Result<Option<f64>, AppError> {
        let client = self.client(None).await?;
        let row = client
            .query_one(
                "SELECT CASE WHEN pg_is_in_recovery() \
                 THEN EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp())::float8 END",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn server_version(&self) -> Result<(u32, u32, u32), AppError> {
        let client = self.client(None).await?;
        let row = client
            .query_one("SELECT current_setting('server_version_num')", &[])
            .await?;
        let raw: String = row.get(0);
        let num = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| AppError::Internal(format!("Unexpected server_version_num {}", raw)))?;
        Ok(parse_version_num(num))
    }

    async fn get_variables(&self, names: &[String]) -> ResultSet {
        match self.try_get_variables(names).await {
            Ok(result) => result,
            Err(e) => failed("pg_settings", e),
        }
    }

    async fn set_variable(&self, name: &str, value: &str) -> ResultSet {
        match self.try_set_variable(name, value).await {
            Ok(result) => result,
            Err(e) => failed(&format!("ALTER SYSTEM SET {}", name), e),
        }
    }

    async fn kill_connection(&self, pid: i32) -> ResultSet {
        match self.try_kill(pid).await {
            Ok(result) => result,
            Err(e) => failed(&format!("SELECT pg_terminate_backend({})", pid), e),
        }
    }

    async fn close(&self) {
        self.pools.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::time::Duration;

    fn unreachable_engine() -> PostgresEngine {
        let instance = Instance::from_connection_string("x", "postgres://u:p@127.0.0.1:1/app").unwrap();
        let config = PoolConfig {
            max_pool_size: 1,
            connect_timeout: Duration::from_millis(200),
        };
        PostgresEngine::new(Arc::new(PoolManager::new(instance, config)))
    }

    #[test]
    fn test_parse_version_num() {
        assert_eq!(parse_version_num(150004), (15, 4, 0));
        assert_eq!(parse_version_num(90624), (9, 6, 24));
    }

    #[tokio::test]
    async fn test_driver_failures_land_in_result() {
        let engine = unreachable_engine();
        let result = engine.query("db1", "select 1;").await;
        assert!(result.error.is_some());

        let set = engine.execute("db1", "update t set a = 1 where id = 1").await;
        assert!(set.error.is_some());

        assert!(engine.is_read_only("db1").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_setting_name_rejected() {
        let engine = unreachable_engine();
        let result = engine.set_variable("work_mem; drop table t", "1").await;
        assert!(result.error.unwrap().contains("Invalid setting name"));
    }
}
