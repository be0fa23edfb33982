//! Inspection backends
//!
//! An inspection backend turns raw SQL into a statement-by-statement verdict
//! and can also run the batch itself. Backends are interchangeable; one is
//! chosen per engine when the engine is built.

pub mod dry_run;
pub mod osc;
pub mod rollback;
pub mod rules;

use crate::config::InspectionBackendKind;
use crate::connection::PoolManager;
use crate::error::InspectionError;
use crate::review::{DatabaseResults, ResultSet, ReviewSet};
use crate::ticket::ChangeTicket;
use async_trait::async_trait;
use std::sync::Arc;

pub use dry_run::DryRunInspector;
pub use osc::OscCommand;
pub use rollback::RollbackStatement;
pub use rules::{RuleInspector, RuleSet};

#[async_trait]
pub trait InspectionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Review `sql` for `database`. Findings are rows; an `Err` means no
    /// verdict could be produced at all.
    async fn check(&self, database: &str, sql: &str) -> Result<ReviewSet, InspectionError>;

    /// Run the ticket's batch on every target database
    async fn execute(&self, ticket: &ChangeTicket) -> DatabaseResults;

    async fn get_rollback(&self, ticket: &ChangeTicket) -> Result<Vec<RollbackStatement>, InspectionError>;

    async fn osc_control(&self, sqlsha1: &str, command: OscCommand) -> Result<ResultSet, InspectionError>;
}

/// Build the configured backend for one instance
pub fn build_inspector(kind: InspectionBackendKind, pools: Arc<PoolManager>) -> Arc<dyn InspectionBackend> {
    match kind {
        InspectionBackendKind::Rules => Arc::new(RuleInspector::new(pools)),
        InspectionBackendKind::DryRun => Arc::new(DryRunInspector::new(pools)),
    }
}
