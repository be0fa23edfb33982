//! Execution reconciliation
//!
//! Folds the outcome of one execution attempt back into its ticket: status,
//! finish time, execute payload, one audit entry and one notification.

use crate::collaborators::{AuditAction, AuditTrail, Notifier};
use crate::config::AggregationPolicy;
use crate::error::AppError;
use crate::review::{DatabaseResults, ErrorLevel, ReviewSet};
use crate::ticket::{TicketStatus, TicketStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Key of the synthetic report written when an attempt produced no results
pub const ALL_DATABASES: &str = "*";

/// What an execution attempt came back with
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Per-database results, however partial
    Completed(DatabaseResults),
    /// The unit of work itself died before producing results
    Crashed(String),
}

/// Reduce per-database results to a terminal status
pub fn aggregate(policy: AggregationPolicy, results: &DatabaseResults) -> TicketStatus {
    let failed = match policy {
        AggregationPolicy::Severity => results
            .values()
            .any(|set| set.max_level() == ErrorLevel::Critical),
        AggregationPolicy::ErrorCount => results
            .values()
            .any(|set| set.error.is_some() || set.error_count > 0 || set.warning_count > 0),
    };
    if failed {
        TicketStatus::Exception
    } else {
        TicketStatus::Finished
    }
}

enum Applied {
    Fresh(TicketStatus),
    AlreadyReconciled(TicketStatus),
    Stale(TicketStatus),
}

pub struct Reconciler {
    store: Arc<TicketStore>,
    audit: Arc<dyn AuditTrail>,
    notifier: Arc<dyn Notifier>,
    policy: AggregationPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<TicketStore>,
        audit: Arc<dyn AuditTrail>,
        notifier: Arc<dyn Notifier>,
        policy: AggregationPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            policy,
        }
    }

    /// Apply the outcome of `attempt`. Replaying an attempt that has already
    /// been applied, or reporting one that is not the ticket's current
    /// attempt, returns the recorded status and changes nothing.
    pub async fn reconcile(
        &self,
        ticket_id: u64,
        attempt: Uuid,
        outcome: ExecutionOutcome,
    ) -> Result<TicketStatus, AppError> {
        let finish_time = Utc::now();
        let policy = self.policy;

        let applied = self
            .store
            .transition(ticket_id, |ticket, content| {
                if ticket.reconciled_attempt == Some(attempt) {
                    return Ok(Applied::AlreadyReconciled(ticket.status));
                }
                if ticket.current_attempt != Some(attempt) {
                    return Ok(Applied::Stale(ticket.status));
                }

                let (decided, results) = match &outcome {
                    ExecutionOutcome::Completed(results) => (aggregate(policy, results), results.clone()),
                    ExecutionOutcome::Crashed(message) => {
                        let mut report = DatabaseResults::new();
                        report.insert(
                            ALL_DATABASES.to_string(),
                            ReviewSet::denied(&ticket.sql, None, "Execute failed", message.clone()),
                        );
                        (TicketStatus::Exception, report)
                    }
                };

                let payload = serde_json::to_value(&results)
                    .map_err(|e| AppError::Internal(format!("Failed to serialize results: {}", e)))?;
                content.execute_payload = Some(payload);
                ticket.reconciled_attempt = Some(attempt);
                ticket.finished_at = Some(finish_time);

                // a ticket cancelled while running keeps its terminal state
                if ticket.status == TicketStatus::Executing {
                    ticket.status = decided;
                }
                Ok(Applied::Fresh(ticket.status))
            })
            .await?;

        let status = match applied {
            Applied::AlreadyReconciled(status) => {
                warn!(ticket_id, %attempt, "Attempt already reconciled, ignoring replay");
                return Ok(status);
            }
            Applied::Stale(status) => {
                warn!(ticket_id, %attempt, "Outcome of an unknown attempt, ignoring");
                return Ok(status);
            }
            Applied::Fresh(status) => status,
        };

        let (action, detail) = match (&outcome, status) {
            (ExecutionOutcome::Crashed(message), _) => {
                (AuditAction::ExecutionFailed, format!("Execution task failed: {}", message))
            }
            (_, TicketStatus::Finished) => (AuditAction::ExecutionFinished, "Execution finished".to_string()),
            (_, status) => (AuditAction::ExecutionFailed, format!("Execution ended as {}", status)),
        };
        if let Err(e) = self.audit.append_log(ticket_id, action, "system", &detail).await {
            error!(ticket_id, "Failed to append audit log: {}", e);
        }
        self.notifier.notify_execution_finished(ticket_id, status).await;

        match status {
            TicketStatus::Finished => info!(ticket_id, "✅ Ticket finished"),
            other => warn!(ticket_id, status = %other, "⚠️  {}", detail),
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewResult;

    fn set_with(levels: &[ErrorLevel]) -> ReviewSet {
        let mut set = ReviewSet::new("x");
        for (i, level) in levels.iter().enumerate() {
            set.push(ReviewResult::new(i + 1, *level, "", "", "x"));
        }
        set
    }

    fn results(sets: Vec<(&str, ReviewSet)>) -> DatabaseResults {
        sets.into_iter().map(|(db, set)| (db.to_string(), set)).collect()
    }

    #[test]
    fn test_severity_policy() {
        let clean = results(vec![("db1", set_with(&[ErrorLevel::Ok])), ("db2", set_with(&[ErrorLevel::Ok]))]);
        assert_eq!(aggregate(AggregationPolicy::Severity, &clean), TicketStatus::Finished);

        let warned = results(vec![("db1", set_with(&[ErrorLevel::Warning]))]);
        assert_eq!(aggregate(AggregationPolicy::Severity, &warned), TicketStatus::Finished);

        let failed = results(vec![("db1", set_with(&[ErrorLevel::Ok])), ("db2", set_with(&[ErrorLevel::Critical]))]);
        assert_eq!(aggregate(AggregationPolicy::Severity, &failed), TicketStatus::Exception);
    }

    #[test]
    fn test_error_count_policy() {
        let warned = results(vec![("db1", set_with(&[ErrorLevel::Ok, ErrorLevel::Warning]))]);
        assert_eq!(aggregate(AggregationPolicy::ErrorCount, &warned), TicketStatus::Exception);

        let clean = results(vec![("db1", set_with(&[ErrorLevel::Ok]))]);
        assert_eq!(aggregate(AggregationPolicy::ErrorCount, &clean), TicketStatus::Finished);
    }

    #[test]
    fn test_top_level_error_fails_under_both_policies() {
        let mut set = set_with(&[ErrorLevel::Ok]);
        set.error = Some("connection reset".to_string());
        let broken = results(vec![("db1", set)]);
        assert_eq!(aggregate(AggregationPolicy::Severity, &broken), TicketStatus::Exception);
        assert_eq!(aggregate(AggregationPolicy::ErrorCount, &broken), TicketStatus::Exception);
    }

    #[test]
    fn test_aggregation_ignores_completion_order() {
        let a = ("db1", set_with(&[ErrorLevel::Critical]));
        let b = ("db2", set_with(&[ErrorLevel::Ok]));
        let forward = results(vec![a.clone(), b.clone()]);
        let backward = results(vec![b, a]);
        for policy in [AggregationPolicy::Severity, AggregationPolicy::ErrorCount] {
            assert_eq!(aggregate(policy, &forward), aggregate(policy, &backward));
        }
    }
}
