//! Review workflow and audit log

use crate::error::AppError;
use crate::ticket::Actor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// State of a ticket's approval flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Waiting for (more) approvals
    Pending,
    Passed,
    Rejected,
    Aborted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    Approved,
    Rejected,
    Cancelled,
    RunWindowChanged,
    Scheduled,
    TimedExecution,
    ExecutionStarted,
    ExecutionFinished,
    ExecutionFailed,
    ExternalExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub ticket_id: u64,
    pub action: AuditAction,
    pub actor: String,
    pub detail: String,
}

/// Approval trail the ticket workflow reports to
#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Open an approval flow for a ticket
    async fn request_review(&self, ticket_id: u64) -> Result<(), AppError>;

    async fn approve(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError>;

    async fn reject(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError>;

    /// Withdrawal by the submitter
    async fn self_cancel(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError>;

    async fn current_state(&self, ticket_id: u64) -> Result<AuditOutcome, AppError>;

    async fn append_log(
        &self,
        ticket_id: u64,
        action: AuditAction,
        actor: &str,
        detail: &str,
    ) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
struct AuditFlow {
    state: AuditOutcome,
    approvals: Vec<String>,
}

/// In-process audit trail with an N-approval flow
pub struct InMemoryAudit {
    required_approvals: usize,
    flows: RwLock<HashMap<u64, AuditFlow>>,
    log: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::with_required_approvals(1)
    }

    pub fn with_required_approvals(required_approvals: usize) -> Self {
        Self {
            required_approvals: required_approvals.max(1),
            flows: RwLock::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
        }
    }

    /// Log entries of one ticket, oldest first
    pub async fn entries(&self, ticket_id: u64) -> Vec<AuditEntry> {
        self.log
            .read()
            .await
            .iter()
            .filter(|e| e.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    async fn push(&self, ticket_id: u64, action: AuditAction, actor: &str, detail: &str) {
        self.log.write().await.push(AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            ticket_id,
            action,
            actor: actor.to_string(),
            detail: detail.to_string(),
        });
    }

    async fn close_flow(
        &self,
        ticket_id: u64,
        outcome: AuditOutcome,
        action: AuditAction,
        actor: &Actor,
        remark: &str,
    ) -> Result<AuditOutcome, AppError> {
        {
            let mut flows = self.flows.write().await;
            let flow = pending_flow(&mut flows, ticket_id)?;
            flow.state = outcome;
        }
        self.push(ticket_id, action, &actor.username, remark).await;
        Ok(outcome)
    }
}

impl Default for InMemoryAudit {
    fn default() -> Self {
        Self::new()
    }
}

fn pending_flow(flows: &mut HashMap<u64, AuditFlow>, ticket_id: u64) -> Result<&mut AuditFlow, AppError> {
    let flow = flows
        .get_mut(&ticket_id)
        .ok_or_else(|| AppError::NotFound(format!("No approval flow for ticket {}", ticket_id)))?;
    if flow.state != AuditOutcome::Pending {
        return Err(AppError::Conflict(format!(
            "Approval flow for ticket {} is already closed",
            ticket_id
        )));
    }
    Ok(flow)
}

#[async_trait]
impl AuditTrail for InMemoryAudit {
    async fn request_review(&self, ticket_id: u64) -> Result<(), AppError> {
        self.flows.write().await.insert(
            ticket_id,
            AuditFlow {
                state: AuditOutcome::Pending,
                approvals: Vec::new(),
            },
        );
        debug!("Opened approval flow for ticket {}", ticket_id);
        Ok(())
    }

    async fn approve(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError> {
        let outcome = {
            let mut flows = self.flows.write().await;
            let flow = pending_flow(&mut flows, ticket_id)?;
            if flow.approvals.contains(&actor.username) {
                return Err(AppError::Conflict(format!(
                    "{} has already approved ticket {}",
                    actor.username, ticket_id
                )));
            }
            flow.approvals.push(actor.username.clone());
            if flow.approvals.len() >= self.required_approvals {
                flow.state = AuditOutcome::Passed;
            }
            flow.state
        };
        self.push(ticket_id, AuditAction::Approved, &actor.username, remark).await;
        Ok(outcome)
    }

    async fn reject(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError> {
        self.close_flow(ticket_id, AuditOutcome::Rejected, AuditAction::Rejected, actor, remark)
            .await
    }

    async fn self_cancel(&self, ticket_id: u64, actor: &Actor, remark: &str) -> Result<AuditOutcome, AppError> {
        self.close_flow(ticket_id, AuditOutcome::Aborted, AuditAction::Cancelled, actor, remark)
            .await
    }

    async fn current_state(&self, ticket_id: u64) -> Result<AuditOutcome, AppError> {
        self.flows
            .read()
            .await
            .get(&ticket_id)
            .map(|f| f.state)
            .ok_or_else(|| AppError::NotFound(format!("No approval flow for ticket {}", ticket_id)))
    }

    async fn append_log(
        &self,
        ticket_id: u64,
        action: AuditAction,
        actor: &str,
        detail: &str,
    ) -> Result<(), AppError> {
        self.push(ticket_id, action, actor, detail).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_approval_passes() {
        let audit = InMemoryAudit::new();
        audit.request_review(1).await.unwrap();
        let outcome = audit.approve(1, &Actor::new("rev").reviewer(), "ok").await.unwrap();
        assert_eq!(outcome, AuditOutcome::Passed);
        assert_eq!(audit.current_state(1).await.unwrap(), AuditOutcome::Passed);
        assert_eq!(audit.entries(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_level_approval() {
        let audit = InMemoryAudit::with_required_approvals(2);
        audit.request_review(1).await.unwrap();

        let first = audit.approve(1, &Actor::new("lead").reviewer(), "").await.unwrap();
        assert_eq!(first, AuditOutcome::Pending);

        // the same reviewer cannot count twice
        assert!(audit.approve(1, &Actor::new("lead").reviewer(), "").await.is_err());

        let second = audit.approve(1, &Actor::new("dba").reviewer(), "").await.unwrap();
        assert_eq!(second, AuditOutcome::Passed);
    }

    #[tokio::test]
    async fn test_closed_flow_rejects_decisions() {
        let audit = InMemoryAudit::new();
        audit.request_review(1).await.unwrap();
        audit.self_cancel(1, &Actor::new("alice"), "typo").await.unwrap();
        assert_eq!(audit.current_state(1).await.unwrap(), AuditOutcome::Aborted);
        assert!(matches!(
            audit.reject(1, &Actor::new("rev").reviewer(), "").await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_flow() {
        let audit = InMemoryAudit::new();
        assert!(matches!(audit.current_state(5).await, Err(AppError::NotFound(_))));
    }
}
