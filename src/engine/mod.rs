//! SQL engines
//!
//! `DatabaseEngine` is the contract every target database technology
//! implements. `SqlEngine` puts the configured inspection backend and the
//! engine-independent check policies in front of it; engines are built once
//! per instance by an `EngineFactory`.

pub mod executor;
pub mod postgres;
pub mod sql_engine;

use crate::config::{ConfigError, Settings};
use crate::connection::{Instance, PoolManager};
use crate::error::AppError;
use crate::inspection::build_inspector;
use crate::review::{DatabaseResults, ResultSet, ReviewSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

pub use postgres::PostgresEngine;
pub use sql_engine::{CheckPolicy, SqlEngine};

/// Native capabilities of a target database
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn instance(&self) -> &Instance;

    /// Whether the engine can take a backup while executing
    fn supports_backup(&self) -> bool {
        false
    }

    /// Run an already-screened read statement
    async fn query(&self, database: &str, sql: &str) -> ResultSet;

    /// Run a batch; failures are recorded on the returned set
    async fn execute(&self, database: &str, sql: &str) -> ReviewSet;

    async fn is_read_only(&self, database: &str) -> Result<bool, AppError>;

    /// Replication lag in seconds; `None` on a primary
    async fn seconds_behind_master(&self) -> Result<Option<f64>, AppError>;

    async fn server_version(&self) -> Result<(u32, u32, u32), AppError>;

    /// Global variables; all of them when `names` is empty
    async fn get_variables(&self, names: &[String]) -> ResultSet;

    async fn set_variable(&self, name: &str, value: &str) -> ResultSet;

    async fn kill_connection(&self, pid: i32) -> ResultSet;

    /// Close every pool owned by the engine
    async fn close(&self);
}

/// Run `task` once per database concurrently and join them in list order
pub async fn fan_out<T, F, Fut>(db_names: &[String], task: F) -> Vec<(String, Result<T, JoinError>)>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let handles: Vec<(String, JoinHandle<T>)> = db_names
        .iter()
        .map(|db| (db.clone(), tokio::spawn(task(db.clone()))))
        .collect();

    let mut joined = Vec::with_capacity(handles.len());
    for (db, handle) in handles {
        joined.push((db, handle.await));
    }
    joined
}

/// Fan out a per-database execution, keyed by database. A task that dies
/// yields a denial for its database instead of a missing entry.
pub async fn fan_out_sets<F, Fut>(db_names: &[String], full_sql: &str, task: F) -> DatabaseResults
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = ReviewSet> + Send + 'static,
{
    fan_out(db_names, task)
        .await
        .into_iter()
        .map(|(db, joined)| {
            let set = match joined {
                Ok(mut set) => {
                    for row in set.rows.iter_mut().filter(|r| r.db_name.is_none()) {
                        row.db_name = Some(db.clone());
                    }
                    set
                }
                Err(e) => {
                    error!(database = %db, "❌ Execution task failed: {}", e);
                    ReviewSet::denied(full_sql, Some(&db), "Execute failed", format!("Execution task failed: {}", e))
                }
            };
            (db, set)
        })
        .collect()
}

/// Hands out the engine for a target instance
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn engine(&self, instance: &str) -> Result<SqlEngine, AppError>;
}

/// Builds PostgreSQL engines with the configured inspection backend,
/// one per instance, reused across tickets
pub struct PostgresEngineFactory {
    settings: Settings,
    policy: Arc<CheckPolicy>,
    instances: HashMap<String, Instance>,
    engines: RwLock<HashMap<String, SqlEngine>>,
}

impl PostgresEngineFactory {
    pub fn new(settings: Settings, instances: Vec<Instance>) -> Result<Self, ConfigError> {
        let policy = Arc::new(CheckPolicy::from_settings(&settings)?);
        Ok(Self {
            settings,
            policy,
            instances: instances.into_iter().map(|i| (i.name.clone(), i)).collect(),
            engines: RwLock::new(HashMap::new()),
        })
    }

    /// Close the pools of every engine built so far
    pub async fn close_all(&self) {
        let engines: Vec<SqlEngine> = self.engines.write().await.drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.close().await;
        }
    }
}

#[async_trait]
impl EngineFactory for PostgresEngineFactory {
    async fn engine(&self, instance: &str) -> Result<SqlEngine, AppError> {
        if let Some(engine) = self.engines.read().await.get(instance) {
            return Ok(engine.clone());
        }

        let target = self
            .instances
            .get(instance)
            .ok_or_else(|| AppError::NotFound(format!("Instance {} not found", instance)))?;

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(instance) {
            return Ok(engine.clone());
        }

        let pools = Arc::new(PoolManager::new(target.clone(), self.settings.pool.clone()));
        let driver = Arc::new(PostgresEngine::new(pools.clone()));
        let inspector = build_inspector(self.settings.inspection.backend, pools);
        let engine = SqlEngine::new(driver, inspector, self.policy.clone());

        info!(
            "🔌 Engine ready for {} ({} inspection)",
            target.to_display_string(),
            engine.inspector_name()
        );
        engines.insert(instance.to_string(), engine.clone());
        Ok(engine)
    }
}
