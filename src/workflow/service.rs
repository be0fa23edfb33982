//! Ticket workflow service
//!
//! Owns the ticket lifecycle: submission with automatic review, approval,
//! cancellation, immediate or timed execution and the accessors around them.

use crate::collaborators::{AuditAction, AuditOutcome, AuditTrail, Notifier, Scheduler};
use crate::config::{AutoReviewPolicy, Settings};
use crate::engine::{EngineFactory, SqlEngine};
use crate::error::{validation_error, ApiResult, AppError};
use crate::inspection::{OscCommand, RollbackStatement};
use crate::review::{total_counts, DatabaseResults, ResultSet, ReviewSet, SyntaxType};
use crate::ticket::{
    Actor, ChangeContent, ChangeTicket, ExecutionMode, SubmitRequest, TicketFilter, TicketStatus, TicketStore,
};
use crate::workflow::coordinator::{ExecutionCoordinator, ExecutionHandle};
use crate::workflow::reconcile::Reconciler;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

/// What an execution trigger led to
#[derive(Debug)]
pub enum TriggerOutcome {
    /// The ticket already reached this state
    Completed(TicketStatus),
    /// Running in the background; the handle resolves once reconciled
    Dispatched(ExecutionHandle),
}

/// Result of a stand-alone check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub results: DatabaseResults,
    pub warning_count: usize,
    pub error_count: usize,
}

/// Whether `set` rejects a ticket under the auto-review policy
fn auto_rejects(policy: AutoReviewPolicy, set: &ReviewSet) -> bool {
    set.error.is_some()
        || (policy.rejects_warnings() && set.warning_count > 0)
        || (policy.rejects_errors() && set.error_count > 0)
}

fn invalid(ticket: &ChangeTicket, action: &'static str) -> AppError {
    AppError::InvalidTransition {
        ticket_id: ticket.id,
        status: ticket.status,
        action,
    }
}

pub struct TicketService {
    settings: Settings,
    store: Arc<TicketStore>,
    engines: Arc<dyn EngineFactory>,
    audit: Arc<dyn AuditTrail>,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<dyn Scheduler>,
    coordinator: ExecutionCoordinator,
}

impl TicketService {
    pub fn new(
        settings: Settings,
        engines: Arc<dyn EngineFactory>,
        audit: Arc<dyn AuditTrail>,
        notifier: Arc<dyn Notifier>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let store = Arc::new(TicketStore::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            audit.clone(),
            notifier.clone(),
            settings.execution.aggregation,
        ));
        Self {
            settings,
            store,
            engines,
            audit,
            notifier,
            scheduler,
            coordinator: ExecutionCoordinator::new(reconciler),
        }
    }

    // ===== SUBMISSION =====

    /// Check a batch on every target database without creating a ticket.
    /// A backend that cannot answer yields a denial for its database.
    pub async fn check_only(&self, instance: &str, db_names: &[String], sql: &str) -> ApiResult<CheckReport> {
        if db_names.is_empty() {
            return Err(validation_error("At least one database is required"));
        }
        let engine = self.engines.engine(instance).await?;
        let results = self.review(&engine, db_names, sql).await;
        let (warning_count, error_count) = total_counts(&results);
        Ok(CheckReport {
            results,
            warning_count,
            error_count,
        })
    }

    async fn review(&self, engine: &SqlEngine, db_names: &[String], sql: &str) -> DatabaseResults {
        engine
            .check_all(db_names, sql)
            .await
            .into_iter()
            .map(|(db, verdict)| {
                let set = verdict.unwrap_or_else(|e| {
                    warn!(database = %db, "❌ Check failed: {}", e);
                    ReviewSet::denied(sql, Some(&db), "Check failed", e.to_string())
                });
                (db, set)
            })
            .collect()
    }

    /// Submit a change. The ticket is created directly in the state its
    /// automatic review decides.
    pub async fn submit(&self, req: SubmitRequest, actor: &Actor) -> ApiResult<ChangeTicket> {
        req.validate()?;
        {
            let mut seen = HashSet::new();
            if let Some(db) = req.db_names.iter().find(|db| !seen.insert(db.as_str())) {
                return Err(validation_error(format!("Database {} is listed twice", db)));
            }
        }
        if let (Some(start), Some(end)) = (req.run_date_start, req.run_date_end) {
            if start > end {
                return Err(validation_error("Run window start must not be after its end"));
            }
        }

        let engine = self.engines.engine(&req.instance).await?;
        let results = self.review(&engine, &req.db_names, &req.sql).await;

        let policy = self.settings.inspection.auto_review_wrong;
        let rejected = results.values().any(|set| auto_rejects(policy, set));
        let status = if rejected {
            TicketStatus::AutoReviewFailed
        } else {
            TicketStatus::ManualReviewing
        };
        let syntax_type = req
            .db_names
            .first()
            .and_then(|db| results.get(db))
            .map(|set| set.syntax_type)
            .unwrap_or(SyntaxType::Unknown);
        let is_backup = req.is_backup || (!self.settings.execution.enable_backup_switch && engine.supports_backup());

        let review_payload = serde_json::to_value(&results)
            .map_err(|e| AppError::Internal(format!("Failed to serialize review: {}", e)))?;
        let ticket = ChangeTicket {
            id: 0,
            title: req.title,
            submitter: actor.username.clone(),
            instance: req.instance,
            db_names: req.db_names,
            sql: req.sql.clone(),
            syntax_type,
            status,
            is_backup,
            run_date_start: req.run_date_start,
            run_date_end: req.run_date_end,
            execution_mode: ExecutionMode::default(),
            created_at: Utc::now(),
            finished_at: None,
            current_attempt: None,
            reconciled_attempt: None,
        };
        let content = ChangeContent {
            ticket_id: 0,
            sql: req.sql,
            review_payload,
            execute_payload: None,
        };
        let ticket = self.store.create(ticket, content).await;

        let (warnings, errors) = total_counts(&results);
        self.log(
            ticket.id,
            AuditAction::Submitted,
            &actor.username,
            &format!("Submitted: {} warning(s), {} error(s)", warnings, errors),
        )
        .await;

        if status == TicketStatus::ManualReviewing {
            self.audit.request_review(ticket.id).await?;
            self.notifier.notify_review_requested(ticket.id, &req.cc_list).await;
            info!(ticket_id = ticket.id, "📝 Ticket submitted for review");
        } else {
            warn!(ticket_id = ticket.id, warnings, errors, "🚫 Ticket failed automatic review");
        }
        Ok(ticket)
    }

    // ===== REVIEW =====

    /// Record an approval; the ticket passes once the approval flow does
    pub async fn approve(&self, ticket_id: u64, actor: &Actor, remark: &str) -> ApiResult<TicketStatus> {
        if !actor.can_review {
            return Err(AppError::PermissionDenied(format!("{} cannot review tickets", actor.username)));
        }
        let ticket = self.store.get(ticket_id).await?;
        if !ticket.status.can_review() {
            return Err(invalid(&ticket, "approve"));
        }

        let outcome = self.audit.approve(ticket_id, actor, remark).await?;
        if outcome != AuditOutcome::Passed {
            debug!(ticket_id, "Approval recorded, flow still {:?}", outcome);
            return Ok(ticket.status);
        }

        let status = self
            .store
            .transition(ticket_id, |t, _| {
                if !t.status.can_review() {
                    return Err(invalid(t, "approve"));
                }
                t.status = TicketStatus::ReviewPassed;
                Ok(t.status)
            })
            .await?;
        self.notifier.notify_review_decided(ticket_id, outcome).await;
        info!(ticket_id, "✅ Ticket approved by {}", actor.username);
        Ok(status)
    }

    pub async fn reject(&self, ticket_id: u64, actor: &Actor, remark: &str) -> ApiResult<TicketStatus> {
        if !actor.can_review {
            return Err(AppError::PermissionDenied(format!("{} cannot review tickets", actor.username)));
        }
        let ticket = self.store.get(ticket_id).await?;
        if !ticket.status.can_review() {
            return Err(invalid(&ticket, "reject"));
        }

        let outcome = self.audit.reject(ticket_id, actor, remark).await?;
        self.abort(ticket_id, "reject").await?;
        self.notifier.notify_review_decided(ticket_id, outcome).await;
        info!(ticket_id, "⛔ Ticket rejected by {}", actor.username);
        Ok(TicketStatus::Aborted)
    }

    /// Abort a ticket from any non-terminal state.
    ///
    /// Work already running is not interrupted; a pending timed trigger is dropped.
    pub async fn cancel(&self, ticket_id: u64, actor: &Actor, remark: &str) -> ApiResult<TicketStatus> {
        let ticket = self.store.get(ticket_id).await?;
        if !ticket.status.can_cancel() {
            return Err(invalid(&ticket, "cancel"));
        }
        let is_submitter = actor.username == ticket.submitter;

        let outcome = if ticket.status == TicketStatus::ManualReviewing {
            if is_submitter {
                self.audit.self_cancel(ticket_id, actor, remark).await?
            } else if actor.can_review {
                self.audit.reject(ticket_id, actor, remark).await?
            } else {
                return Err(AppError::PermissionDenied(format!(
                    "{} cannot cancel ticket {}",
                    actor.username, ticket_id
                )));
            }
        } else {
            if !is_submitter && !actor.can_review {
                return Err(AppError::PermissionDenied(format!(
                    "{} cannot cancel ticket {}",
                    actor.username, ticket_id
                )));
            }
            let detail = if is_submitter {
                format!("cancelled: {}", remark)
            } else {
                format!("review not passed: {}", remark)
            };
            self.log(ticket_id, AuditAction::Cancelled, &actor.username, &detail).await;
            AuditOutcome::Aborted
        };

        let previous = self.abort(ticket_id, "cancel").await?;
        if previous == TicketStatus::Scheduled && !self.scheduler.cancel(&ticket.task_name()).await {
            warn!(ticket_id, "No pending trigger found for scheduled ticket");
        }
        if previous == TicketStatus::Executing {
            warn!(ticket_id, "Ticket aborted while executing, running work continues");
        }

        self.notifier.notify_review_decided(ticket_id, outcome).await;
        info!(ticket_id, "🛑 Ticket aborted by {}", actor.username);
        Ok(TicketStatus::Aborted)
    }

    /// Move the ticket to aborted, returning the status it was in
    async fn abort(&self, ticket_id: u64, action: &'static str) -> ApiResult<TicketStatus> {
        self.store
            .transition(ticket_id, |t, _| {
                if t.status.is_terminal() {
                    return Err(invalid(t, action));
                }
                let previous = t.status;
                t.status = TicketStatus::Aborted;
                t.finished_at = Some(Utc::now());
                Ok(previous)
            })
            .await
    }

    /// Change the executable window of a ticket that is not finished yet
    pub async fn alter_run_window(
        &self,
        ticket_id: u64,
        actor: &Actor,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> ApiResult<ChangeTicket> {
        if !actor.can_review {
            return Err(AppError::PermissionDenied(format!(
                "{} cannot change run windows",
                actor.username
            )));
        }
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(validation_error("Run window start must not be after its end"));
            }
        }

        let ticket = self
            .store
            .transition(ticket_id, |t, _| {
                if t.status.is_terminal() {
                    return Err(invalid(t, "change run window"));
                }
                t.run_date_start = start;
                t.run_date_end = end;
                Ok(t.clone())
            })
            .await?;

        let detail = format!(
            "Run window set to {} .. {}",
            start.map_or_else(|| "open".to_string(), |s| s.to_rfc3339()),
            end.map_or_else(|| "open".to_string(), |e| e.to_rfc3339()),
        );
        self.log(ticket_id, AuditAction::RunWindowChanged, &actor.username, &detail).await;
        Ok(ticket)
    }

    // ===== EXECUTION =====

    /// Trigger execution of an approved ticket now.
    ///
    /// Manual runs are awaited, automatic runs come back as a handle and
    /// external runs only record that the change was applied elsewhere.
    pub async fn execute(&self, ticket_id: u64, actor: &Actor, mode: ExecutionMode) -> ApiResult<TriggerOutcome> {
        let ticket = self.store.get(ticket_id).await?;
        self.guard_execution(&ticket, actor)?;
        if !ticket.status.can_execute() {
            return Err(invalid(&ticket, "execute"));
        }

        match mode {
            ExecutionMode::External => self.confirm_external(ticket_id, actor).await.map(TriggerOutcome::Completed),
            ExecutionMode::Manual => {
                let handle = self.start(ticket_id, mode, TicketStatus::ReviewPassed, actor).await?;
                Ok(TriggerOutcome::Completed(handle.wait().await?))
            }
            ExecutionMode::Automatic => {
                let engine = self.engines.engine(&ticket.instance).await?;
                self.recheck(&engine, &ticket).await?;
                let handle = self.start(ticket_id, mode, TicketStatus::ReviewPassed, actor).await?;
                Ok(TriggerOutcome::Dispatched(handle))
            }
        }
    }

    fn guard_execution(&self, ticket: &ChangeTicket, actor: &Actor) -> ApiResult<()> {
        if !actor.can_execute {
            return Err(AppError::PermissionDenied(format!(
                "{} cannot execute tickets",
                actor.username
            )));
        }
        if !ticket.in_run_window(Utc::now()) {
            return Err(AppError::Denied(format!(
                "Ticket {} is outside its executable window",
                ticket.id
            )));
        }
        Ok(())
    }

    /// Check the approved SQL again; any rejection denies the run
    async fn recheck(&self, engine: &SqlEngine, ticket: &ChangeTicket) -> ApiResult<()> {
        let policy = self.settings.inspection.auto_review_wrong;
        for (db, verdict) in engine.check_all(&ticket.db_names, &ticket.sql).await {
            let set = verdict.map_err(|e| AppError::Denied(format!("Re-check on {} failed: {}", db, e)))?;
            if auto_rejects(policy, &set) {
                return Err(AppError::Denied(format!(
                    "Re-check on {} rejected the SQL: {} warning(s), {} error(s)",
                    db, set.warning_count, set.error_count
                )));
            }
        }
        Ok(())
    }

    async fn confirm_external(&self, ticket_id: u64, actor: &Actor) -> ApiResult<TicketStatus> {
        let status = self
            .store
            .transition(ticket_id, |t, _| {
                if !t.status.can_execute() {
                    return Err(invalid(t, "execute"));
                }
                t.execution_mode = ExecutionMode::External;
                t.status = TicketStatus::Finished;
                t.finished_at = Some(Utc::now());
                Ok(t.status)
            })
            .await?;
        self.log(ticket_id, AuditAction::ExternalExecution, &actor.username, "Applied outside the engine")
            .await;
        self.notifier.notify_execution_finished(ticket_id, status).await;
        info!(ticket_id, "✅ External execution confirmed by {}", actor.username);
        Ok(status)
    }

    /// Move the ticket from `from` to executing and hand the run to the coordinator
    async fn start(
        &self,
        ticket_id: u64,
        mode: ExecutionMode,
        from: TicketStatus,
        actor: &Actor,
    ) -> ApiResult<ExecutionHandle> {
        let current = self.store.get(ticket_id).await?;
        let engine = self.engines.engine(&current.instance).await?;
        let attempt = Uuid::new_v4();

        let ticket = self
            .store
            .transition(ticket_id, |t, _| {
                if t.status != from {
                    return Err(invalid(t, "start execution"));
                }
                t.status = TicketStatus::Executing;
                t.execution_mode = mode;
                t.current_attempt = Some(attempt);
                Ok(t.clone())
            })
            .await?;
        self.log(
            ticket_id,
            AuditAction::ExecutionStarted,
            &actor.username,
            &format!("{:?} execution on {} database(s)", mode, ticket.db_names.len()),
        )
        .await;
        info!(ticket_id, %attempt, "🚀 Executing on {:?}", ticket.db_names);

        Ok(self.coordinator.dispatch(ticket_id, attempt, async move {
            Ok(engine.execute_workflow(&ticket).await)
        }))
    }

    /// Defer execution of an approved ticket to `run_at`
    pub async fn schedule(&self, ticket_id: u64, actor: &Actor, run_at: DateTime<Utc>) -> ApiResult<ChangeTicket> {
        let ticket = self.store.get(ticket_id).await?;
        if !actor.can_execute {
            return Err(AppError::PermissionDenied(format!(
                "{} cannot execute tickets",
                actor.username
            )));
        }
        if !ticket.status.can_execute() {
            return Err(invalid(&ticket, "schedule"));
        }
        if run_at < Utc::now() {
            return Err(validation_error("Run time must not be in the past"));
        }
        if !ticket.in_run_window(run_at) {
            return Err(validation_error("Run time must fall inside the executable window"));
        }

        let task_name = ticket.task_name();
        self.scheduler.schedule_at(&task_name, run_at, ticket_id).await?;
        let scheduled = self
            .store
            .transition(ticket_id, |t, _| {
                if !t.status.can_execute() {
                    return Err(invalid(t, "schedule"));
                }
                t.status = TicketStatus::Scheduled;
                t.execution_mode = ExecutionMode::Automatic;
                Ok(t.clone())
            })
            .await;
        let scheduled = match scheduled {
            Ok(ticket) => ticket,
            Err(e) => {
                self.scheduler.cancel(&task_name).await;
                return Err(e);
            }
        };

        self.log(
            ticket_id,
            AuditAction::Scheduled,
            &actor.username,
            &format!("Scheduled for {}", run_at.to_rfc3339()),
        )
        .await;
        info!(ticket_id, "⏰ Ticket scheduled for {}", run_at);
        Ok(scheduled)
    }

    /// Fire a scheduled ticket. A failed re-check leaves it scheduled.
    pub async fn run_scheduled(&self, ticket_id: u64) -> ApiResult<ExecutionHandle> {
        let system = Actor::system();
        let ticket = self.store.get(ticket_id).await?;
        if ticket.status != TicketStatus::Scheduled {
            return Err(invalid(&ticket, "run scheduled execution"));
        }
        self.log(ticket_id, AuditAction::TimedExecution, &system.username, "Timed execution fired")
            .await;

        let engine = self.engines.engine(&ticket.instance).await?;
        let checked = match self.guard_execution(&ticket, &system) {
            Ok(()) => self.recheck(&engine, &ticket).await,
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            self.log(ticket_id, AuditAction::ExecutionFailed, &system.username, &e.to_string())
                .await;
            warn!(ticket_id, "⛔ Timed execution denied: {}", e);
            return Err(e);
        }

        self.start(ticket_id, ExecutionMode::Automatic, TicketStatus::Scheduled, &system)
            .await
    }

    /// Consume due ticket ids from a scheduler until its channel closes
    pub async fn run_scheduler(self: Arc<Self>, mut due: mpsc::UnboundedReceiver<u64>) {
        info!("⏰ Scheduler loop started");
        while let Some(ticket_id) = due.recv().await {
            match self.run_scheduled(ticket_id).await {
                Ok(handle) => debug!(ticket_id, attempt = %handle.attempt, "Timed execution dispatched"),
                Err(e) => error!(ticket_id, "Timed execution did not start: {}", e),
            }
        }
        info!("Scheduler loop stopped");
    }

    // ===== ACCESSORS =====

    pub async fn status(&self, ticket_id: u64) -> ApiResult<TicketStatus> {
        Ok(self.store.get(ticket_id).await?.status)
    }

    pub async fn get(&self, ticket_id: u64) -> ApiResult<ChangeTicket> {
        self.store.get(ticket_id).await
    }

    pub async fn content(&self, ticket_id: u64) -> ApiResult<ChangeContent> {
        self.store.content(ticket_id).await
    }

    pub async fn list(&self, filter: &TicketFilter) -> Vec<ChangeTicket> {
        self.store.list(filter).await
    }

    /// Run a read-only query on one database of an instance
    pub async fn query(&self, instance: &str, database: &str, sql: &str, limit: u64) -> ApiResult<ResultSet> {
        let engine = self.engines.engine(instance).await?;
        Ok(engine.query(database, sql, limit).await)
    }

    pub async fn rollback_statements(&self, ticket_id: u64) -> ApiResult<Vec<RollbackStatement>> {
        let ticket = self.store.get(ticket_id).await?;
        let engine = self.engines.engine(&ticket.instance).await?;
        Ok(engine.get_rollback(&ticket).await?)
    }

    pub async fn osc_control(&self, ticket_id: u64, sqlsha1: &str, command: OscCommand) -> ApiResult<ResultSet> {
        let ticket = self.store.get(ticket_id).await?;
        let engine = self.engines.engine(&ticket.instance).await?;
        Ok(engine.osc_control(sqlsha1, command).await)
    }

    async fn log(&self, ticket_id: u64, action: AuditAction, actor: &str, detail: &str) {
        if let Err(e) = self.audit.append_log(ticket_id, action, actor, detail).await {
            error!(ticket_id, "Failed to append audit log: {}", e);
        }
    }
}
